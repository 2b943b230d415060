use anyhow::Result;
use aproxy_core::proxy;

/// Print the proxy URL for `stream`.
pub fn run_url(stream: &str, next: Option<&str>, port: u16) -> Result<()> {
    let uri = proxy::create_uri(port, stream, next)?;
    println!("{}", uri);
    Ok(())
}
