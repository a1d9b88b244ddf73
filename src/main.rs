use video_searcher::config::Config;
use video_searcher::{cli, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cmd = cli::build_cli();
    let matches = cmd.get_matches();
    let log_level = matches.get_one::<String>("log-level").cloned();
    let version_flag = matches.get_flag("version");

    if version_flag {
        println!("video-searcher {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    cli::init_logging(log_level.as_deref());

    let cfg = Config::from_env()?;
    server::run_stdio_server(&cfg).await
}
