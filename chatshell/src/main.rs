use std::io::stdout;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use chatshell::App;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match std::env::var("CHATSHELL_LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().with_current_span(true).init(),
        _ => builder.with_target(false).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Loads .env files, so it goes before the subscriber reads RUST_LOG.
    let args = App::args();
    init_tracing();

    let app = App::from_args(args);
    app.run(args, &mut stdout()).await
}
