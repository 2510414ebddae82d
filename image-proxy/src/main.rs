//! Serve one container image over a socket, a pipe or a loopback port.

use std::os::fd::{FromRawFd as _, OwnedFd, RawFd};
use std::time::Duration;

use clap::Parser;
use eyre::{bail, eyre, WrapErr as _};
use image_proxy::{session, ImageName, ImageProxy, Platform, Protocol, Transport};
use registry_client::Credentials;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "container-image-proxy", version, about)]
struct Args {
    /// Image to serve, e.g. docker://quay.io/fedora/fedora:latest or oci:/srv/layout:tag
    image: ImageName,

    /// Serve on this inherited, connected socket
    #[arg(long, value_name = "FD")]
    sockfd: Option<RawFd>,

    /// Serve HTTP on this TCP port on localhost
    #[arg(long)]
    port: Option<u16>,

    /// Protocol to speak; rpc needs --sockfd
    #[arg(long, value_enum, default_value_t)]
    protocol: Protocol,

    /// Platform to pick from multi-platform images, as os/arch[/variant]
    #[arg(long)]
    platform: Option<Platform>,

    /// Fail blob transfers which take longer than this many seconds
    #[arg(long, value_name = "SECS")]
    transfer_timeout: Option<u64>,

    /// Registry credentials
    #[arg(long, value_name = "USER:PASSWORD")]
    creds: Option<String>,

    /// Only log errors, and not those of individual requests
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Args::parse();

    let default_level = if args.quiet { "error" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut builder = ImageProxy::builder()
        .image(args.image)
        .quiet(args.quiet);
    if let Some(platform) = args.platform {
        builder = builder.platform(platform);
    }
    if let Some(secs) = args.transfer_timeout {
        builder = builder.transfer_timeout(Duration::from_secs(secs));
    }
    if let Some(creds) = args.creds.as_deref() {
        let credentials =
            Credentials::parse(creds).ok_or_else(|| eyre!("--creds must be USER:PASSWORD"))?;
        builder = builder.credentials(credentials);
    }
    let proxy = builder.build()?;

    let fd = args.sockfd.map(inherit).transpose()?;
    let transport = Transport::select(fd, args.port);

    session::run(proxy, transport, args.protocol)
        .await
        .wrap_err("session failed")?;
    Ok(())
}

/// Take ownership of a descriptor passed down by our parent.
#[allow(unsafe_code)]
fn inherit(fd: RawFd) -> eyre::Result<OwnedFd> {
    if fd < 0 {
        bail!("invalid descriptor {fd}");
    }
    nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD)
        .wrap_err_with(|| format!("descriptor {fd} is not open"))?;

    // SAFETY: the descriptor is open, and nothing else in this process
    // claims it; it was inherited for us to serve on.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
