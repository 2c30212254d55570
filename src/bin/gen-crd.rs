use kube::CustomResourceExt;
use kulta_batch::crd::rollout::BatchRollout;

fn main() -> anyhow::Result<()> {
    // Use: cargo run --bin gen-crd | python3 -c "import sys,json,yaml; print(yaml.dump(json.load(sys.stdin), default_flow_style=False))"
    // to convert to YAML
    let crd = BatchRollout::crd();

    let json_output = serde_json::to_string_pretty(&crd)?;
    println!("{}", json_output);
    Ok(())
}
