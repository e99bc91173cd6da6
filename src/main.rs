use std::{error::Error, sync::Arc};

use tokio_util::sync::CancellationToken;
use ytplay_rs::{
    config::Config,
    ffmpeg::{ConversionRequest, Mp4Converter},
    process::ProcessRunner,
    resolver::Resolver,
    tools::{ToolKind, ToolManager},
    util,
};

const USAGE: &str = "Usage: ytplay-rs [--title | --convert] <url>\n       ytplay-rs --update | --install";

enum Action {
    Resolve(String),
    Title(String),
    Convert(String),
    Update,
    Install,
}

fn parse_args() -> Option<Action> {
    let mut args = std::env::args().skip(1);
    let first = args.next()?;

    match first.as_str() {
        "--title" => args.next().map(Action::Title),
        "--convert" => args.next().map(Action::Convert),
        "--update" => Some(Action::Update),
        "--install" => Some(Action::Install),
        "-h" | "--help" => None,
        _ => Some(Action::Resolve(first)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let Some(action) = parse_args() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let config = Config::from_env()?;
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Cancelling");
                cancel.cancel();
            }
        });
    }

    // Locate or download the tools
    let client = util::HttpClient::new()?;
    let mut tools = ToolManager::new(config.tools_dir(), Arc::new(client), ProcessRunner::new())
        .with_stale_after(config.tool_stale_after());
    if let Some(path) = &config.ytdlp_path {
        tools = tools.with_override(ToolKind::YtDlp, path);
    }
    if let Some(path) = &config.ffmpeg_path {
        tools = tools.with_override(ToolKind::Ffmpeg, path);
    }

    let ytdlp = match action {
        Action::Install => tools.refresh_if_stale(ToolKind::YtDlp, &cancel).await?,
        _ => tools.ensure(ToolKind::YtDlp, &cancel).await?,
    };
    let ffmpeg = match action {
        Action::Convert(_) | Action::Install => Some(tools.ensure(ToolKind::Ffmpeg, &cancel).await?),
        _ => tools.locate(ToolKind::Ffmpeg),
    };

    let mut runner = ProcessRunner::new();
    if let Some(dir) = ffmpeg.as_deref().and_then(|p| p.parent()) {
        runner = runner.with_ffmpeg_location(dir);
    }

    let resolver = Resolver::new(runner.clone(), &ytdlp, config.settings.clone())
        .with_timeout(config.process_timeout())
        .with_default_ttl(config.default_ttl())
        .with_cache_file(config.cache_file());
    resolver.load_cache().await?;

    let outcome = run(action, &config, &resolver, runner, ffmpeg, &cancel).await;
    resolver.persist().await?;
    outcome
}

async fn run(
    action: Action,
    config: &Config,
    resolver: &Resolver,
    runner: ProcessRunner,
    ffmpeg: Option<std::path::PathBuf>,
    cancel: &CancellationToken,
) -> Result<(), Box<dyn Error>> {
    match action {
        Action::Resolve(url) => {
            let resolved = resolver.resolve(&url, cancel).await?;
            println!("{}", resolved.title);
            println!("{}", resolved.direct_url);
        }
        Action::Title(url) => {
            println!("{}", resolver.resolve_title(&url, cancel).await?);
        }
        Action::Convert(url) => {
            let resolved = resolver.resolve(&url, cancel).await?;
            let ffmpeg = ffmpeg.ok_or("ffmpeg is not available")?;
            let converter = Mp4Converter::new(runner, ffmpeg, config.conversion_dir())
                .with_timeout(config.conversion_timeout())
                .with_capacity(config.conversion_capacity);

            let mut request = ConversionRequest::new(resolved.direct_url);
            request.time_range = config.settings.time_range;
            println!("{}", converter.convert(&request, cancel).await?.display());
        }
        Action::Update => {
            println!("{:?}", resolver.update_tool(cancel).await?);
        }
        Action::Install => {
            println!("Tools ready");
        }
    }

    Ok(())
}
