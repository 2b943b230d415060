//! Checksum command: md5 of a file in ETag form.

use anyhow::Result;
use aproxy_core::checksum;
use std::path::Path;

/// Print the quoted md5 of `path`, comparable to an upstream ETag.
pub fn run_checksum(path: &Path) -> Result<()> {
    let etag = checksum::etag_for_path(path)?;
    println!("{}  {}", etag, path.display());
    Ok(())
}
