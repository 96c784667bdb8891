use anyhow::Context;
use std::path::Path;

/// Ticker universe from `--tickers-file` (one symbol per line, `#` comments)
/// or the comma-separated `UNIVERSE_TICKERS`. Symbols are upper-cased,
/// sorted and de-duplicated.
pub fn load_tickers(tickers_file: Option<&Path>) -> anyhow::Result<Vec<String>> {
    let raw = match tickers_file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("read tickers file {} failed", path.display()))?,
        None => std::env::var("UNIVERSE_TICKERS").unwrap_or_default(),
    };

    let tickers = parse_tickers(&raw);
    anyhow::ensure!(
        !tickers.is_empty(),
        "ticker universe is empty (pass --tickers-file or set UNIVERSE_TICKERS)"
    );
    Ok(tickers)
}

fn parse_tickers(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = raw
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default())
        .flat_map(|line| line.split(','))
        .map(|t| t.trim().to_ascii_uppercase())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

pub fn fetch_concurrency() -> usize {
    std::env::var("FETCH_CONCURRENCY")
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(revrank_core::ingest::provider::DEFAULT_FETCH_CONCURRENCY)
}
