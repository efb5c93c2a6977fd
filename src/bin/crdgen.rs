use kube::CustomResourceExt;

use scaleloop::types::{PodAutoscaler, ServerlessService};

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&PodAutoscaler::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&ServerlessService::crd())?);
    Ok(())
}
