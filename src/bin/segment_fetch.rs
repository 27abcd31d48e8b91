use std::env;
use std::path::Path;
use std::sync::Arc;

use video_segment_downloader::core::client::HttpDownloaderClient;
use video_segment_downloader::core::models::{DownloadCredentials, DownloadItem};
use video_segment_downloader::core::playlist::PlaylistResolver;
use video_segment_downloader::utils::file_utils::sanitize_filename;
use video_segment_downloader::utils::logging::init_tracing_with;
use video_segment_downloader::{DownloadJob, EngineConfig};

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: segment_fetch <url> <output-file> [connections]");
        std::process::exit(1);
    }

    let link = args[1].clone();
    let output = Path::new(&args[2]);
    let connections = args.get(3).and_then(|value| value.parse::<u32>().ok());

    let config = EngineConfig::load().unwrap_or_else(|err| {
        eprintln!("Using default configuration: {err}");
        EngineConfig::default()
    });
    init_tracing_with(&config.logging);

    if let Err(error) = fetch(&config, link, output, connections).await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn fetch(
    config: &EngineConfig,
    link: String,
    output: &Path,
    connections: Option<u32>,
) -> anyhow::Result<()> {
    let folder = output
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = output
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("{} has no file name", output.display()))?;

    let mut credentials = DownloadCredentials::new(link);
    credentials.m3u8 = is_playlist_link(&credentials.link);

    let mut item = DownloadItem::new(
        1,
        credentials,
        folder.to_string_lossy().to_string(),
        sanitize_filename(&name.to_string_lossy()),
    );
    item.preferred_connection_count = connections;

    let client = Arc::new(HttpDownloaderClient::new(&config.download)?);
    let resolver = Arc::new(PlaylistResolver::new(config.hls.probe_concurrency));
    let job = DownloadJob::from_config(item.into_shared(), client, resolver, config);

    job.run().await?;

    let item = job.item().read();
    println!("Saved: {}", item.output_path().display());
    println!("Size: {} bytes", item.content_length);
    Ok(())
}

fn is_playlist_link(link: &str) -> bool {
    let path = link.split(['?', '#']).next().unwrap_or(link);
    path.to_ascii_lowercase().ends_with(".m3u8")
}
