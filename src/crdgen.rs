use kube::CustomResourceExt;
fn main() {
    let documents = vec![
        simple_database_provisioner::resources::SimpleDatabaseInstance::crd(),
        simple_database_provisioner::resources::SimpleDatabaseBinding::crd(),
    ];

    for document in documents {
        print!("---\n");
        print!("{}", serde_yaml::to_string(&document).unwrap());
    }
}
