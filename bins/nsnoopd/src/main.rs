//! nsnoopd - snoop ARP/NA replies and keep SVI neighbors reachable.

use std::ffi::CString;

use anyhow::{Context, bail};
use clap::Parser;
use nsnoop::{Config, Daemon, Family};

#[derive(Parser)]
#[command(
    name = "nsnoopd",
    version,
    about = "Listens for ARP and NA replies and adds the neighbor to the neighbors table"
)]
struct Cli {
    /// Bridge/SVI parent interface to monitor.
    #[arg(value_name = "IFNAME_MON")]
    ifname: String,

    /// Only handle IPv4 ARP reply packets.
    #[arg(short = '4', long = "ipv4", conflicts_with = "ipv6")]
    ipv4: bool,

    /// Only handle IPv6 NA packets.
    #[arg(short = '6', long = "ipv6")]
    ipv6: bool,

    /// Handle a fixed number of replies before terminating (debug aid).
    #[arg(short = 'c', long = "count", value_name = "NUM")]
    count: Option<u64>,

    /// Flag interfaces matching this regular expression as ignored.
    /// Example: -f '^br0|.*-v1$'
    #[arg(short = 'f', long = "deny-filter", value_name = "REGEXP")]
    deny_filter: Option<String>,

    /// Disable the default IPv6 link-local filter.
    #[arg(short = 'l', long = "disable-ipv6ll-filter")]
    disable_ipv6ll_filter: bool,

    /// Do not replace a present ingress classifier.
    #[arg(short = 'q', long = "no-qfilter-replace")]
    no_qfilter_replace: bool,

    /// Verbose output; repeat for debug and trace.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Attach the classifier at XDP instead of TC ingress. Only works on
    /// devices that present the VLAN header to XDP.
    #[arg(short = 'x', long = "xdp")]
    xdp: bool,
}

fn ifindex_of(name: &str) -> anyhow::Result<u32> {
    let cname = CString::new(name).context("interface name contains NUL")?;
    let ifindex = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if ifindex == 0 {
        bail!("invalid network device {name}");
    }
    Ok(ifindex)
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.count == Some(0) {
        bail!("invalid count");
    }

    let deny_filter = cli
        .deny_filter
        .as_deref()
        .map(regex::Regex::new)
        .transpose()
        .context("invalid deny filter")?;

    let family = match (cli.ipv4, cli.ipv6) {
        (true, false) => Some(Family::Ipv4),
        (false, true) => Some(Family::Ipv6),
        _ => None,
    };

    let config = Config {
        ifindex_mon: ifindex_of(&cli.ifname)?,
        ifname_mon: cli.ifname.clone(),
        family,
        count: cli.count,
        deny_filter,
        learn_link_local: cli.disable_ipv6ll_filter,
        keep_existing_filter: cli.no_qfilter_replace,
        use_xdp: cli.xdp,
    };

    let mut daemon = Daemon::new(config)
        .await
        .with_context(|| format!("setup failed on {}", cli.ifname))?;
    daemon.run().await?;
    Ok(())
}
