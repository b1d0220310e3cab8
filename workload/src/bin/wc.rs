use mrf_driver::{Driver, Job};

#[tokio::main]
async fn main() {
    let wc = workload::try_named("wc").expect("word count is registered");
    Driver::new(Job::new(wc)).main().await;
}
