use kube::CustomResourceExt;
use replicadb_k8s::crd::{Backup, BackupPolicy, BackupTool, Cluster};

fn main() -> anyhow::Result<()> {
    let crds = [Cluster::crd(), Backup::crd(), BackupPolicy::crd(), BackupTool::crd()];
    for crd in crds {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
