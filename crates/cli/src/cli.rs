use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "contactsync", version, about = "Apply contact sync payloads to a local database")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// SQLite database URL. Falls back to `CONTACT_SYNC_DATABASE_URL`.
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Retries after the first attempt. Falls back to `CONTACT_SYNC_RETRY_LIMIT`.
    #[arg(long, global = true)]
    pub retry_limit: Option<u32>,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Queue a downloaded contact stream and run it to completion.
    Ingest(IngestArgs),
    /// Run every unfinished job left in the database.
    Resume(IdentityArgs),
    /// List unfinished jobs as JSON lines.
    Pending,
}

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Plaintext contact stream on disk.
    #[arg(value_name = "FILE")]
    pub path: PathBuf,

    /// Treat the payload as a partial list; nothing is pruned.
    #[arg(long, default_value_t = false)]
    pub incomplete: bool,

    #[command(flatten)]
    pub identity: IdentityArgs,
}

#[derive(Args, Debug)]
pub struct IdentityArgs {
    /// ACI of the local account.
    #[arg(long, env = "CONTACT_SYNC_LOCAL_ACI")]
    pub local_aci: String,

    /// Phone number(s) of the local account, in E.164 form.
    #[arg(
        long = "local-number",
        env = "CONTACT_SYNC_LOCAL_NUMBER",
        value_delimiter = ',',
        num_args = 1..,
        required = true
    )]
    pub local_numbers: Vec<String>,

    /// Directory relative payload paths resolve against.
    #[arg(long, default_value = ".")]
    pub attachments_dir: PathBuf,
}
