//! Inspect command: what the cache knows about one stream.

use anyhow::Result;
use aproxy_core::config::ProxyConfig;
use aproxy_core::storage::Store;
use std::path::Path;

pub fn run_inspect(cfg: &ProxyConfig, stream: &str, cache_dir: Option<&Path>) -> Result<()> {
    let base = match cache_dir {
        Some(dir) => dir.to_path_buf(),
        None => cfg.cache_dir()?,
    };
    let store = Store::open(&base, cfg.chunk_size)?;
    let item = store.get_metadata(stream);
    let record = item.snapshot();
    let total = record.number_of_chunks(cfg.chunk_size);

    println!("url:            {}", item.url());
    println!("hash:           {}", item.hash());
    println!("content length: {}", record.content_length);
    println!("etag:           {}", record.etag.as_deref().unwrap_or("-"));
    match store.complete_file(stream) {
        Some(path) => println!("state:          complete ({})", path.display()),
        None if record.content_length == 0 => println!("state:          not cached"),
        None => {
            println!(
                "state:          incomplete ({}/{} chunks)",
                record.downloaded.len(),
                total
            );
            if !record.is_ordered() {
                println!("arrival order:  {:?}", record.downloaded);
            }
        }
    }
    Ok(())
}
