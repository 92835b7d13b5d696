use std::path::PathBuf;

use clap::Parser;

/// Local ephemeral exposure tool: turns a local port or a set of files into
/// a short-lived public HTTPS endpoint.
#[derive(Debug, Parser)]
#[command(name = "cfshare", version, about)]
pub struct Cli {
    /// Operation to run: env-check, policy, expose-port, expose-files,
    /// list/get, stop, logs, audit, maintenance.
    pub tool: String,

    /// JSON object with the tool's parameters.
    #[arg(long)]
    pub params: Option<String>,

    /// Path to a file containing the JSON parameters object.
    #[arg(long, conflicts_with = "params")]
    pub params_file: Option<PathBuf>,

    /// JSON policy patch overriding runtime config for this invocation
    /// only; never persisted to `policy.json` (use the `policy` tool's
    /// `patch` param for that).
    #[arg(long)]
    pub config: Option<String>,

    /// Path to a file containing a JSON policy patch, applied the same way
    /// as `--config`.
    #[arg(long, conflicts_with = "config")]
    pub config_file: Option<PathBuf>,

    /// Directory used to resolve relative paths and ignore rules for
    /// expose-files; defaults to the current directory.
    #[arg(long)]
    pub workspace_dir: Option<PathBuf>,

    /// Run expose-port/expose-files in a detached background worker and
    /// return immediately.
    #[arg(long, conflicts_with = "no_keep_alive")]
    pub keep_alive: bool,

    /// Explicitly run in the foreground (the default); accepted for
    /// symmetry with --keep-alive.
    #[arg(long)]
    pub no_keep_alive: bool,

    /// Print result JSON on a single line instead of pretty-printed.
    #[arg(long)]
    pub compact: bool,
}
