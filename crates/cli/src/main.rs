use clap::Parser;

use contactsync_cli::{Cli, run};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    contactsync_observability::init_with_default(&cli.log);

    let mut stdout = std::io::stdout().lock();
    run(cli, &mut stdout).await
}
