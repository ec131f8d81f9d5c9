use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    clinic_call_lib::logger::init();
    clinic_call_lib::run()
        .await
        .context("clinic call demo failed")
}
