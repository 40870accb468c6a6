use bridger_core::{BridgeConfig, ListenerConfig, RestartPolicy};
use clap::Parser;
use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

/// Transparent TCP relay.
///
/// Without ports, starts itself in the background relaying 5432 to 5433.
#[derive(Parser, Debug, Clone)]
#[command(name = "bridger", version, about)]
pub struct Args {
    /// Port to accept connections on
    #[arg(requires = "upstream_port")]
    pub listen_port: Option<u16>,

    /// Port every accepted connection is relayed to
    pub upstream_port: Option<u16>,

    /// Host every accepted connection is relayed to
    #[arg(long, default_value = "127.0.0.1")]
    pub upstream_host: String,

    /// Address to accept connections on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub listen_host: IpAddr,

    /// Close bridged connections idle for this many seconds
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,

    /// On close, wait this long for data already read to be written out
    #[arg(long, value_name = "MS", default_value_t = 500)]
    pub close_grace: u64,

    /// Give up on the upstream after this many seconds (0 waits forever)
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub connect_timeout: u64,

    /// Back off exponentially from this many milliseconds when the listener
    /// keeps failing, instead of restarting right away
    #[arg(long, value_name = "MS")]
    pub restart_backoff: Option<u64>,

    /// Upper bound for the restart backoff
    #[arg(long, value_name = "MS", default_value_t = 30_000)]
    pub restart_backoff_max: u64,
}

impl Args {
    pub fn ports(&self) -> Option<(u16, u16)> {
        Some((self.listen_port?, self.upstream_port?))
    }

    pub fn listener_config(&self, listen_port: u16, upstream_port: u16) -> ListenerConfig {
        let restart = match self.restart_backoff {
            Some(initial) => RestartPolicy::backoff(
                Duration::from_millis(initial),
                Duration::from_millis(self.restart_backoff_max.max(initial)),
            ),
            None => RestartPolicy::Immediate,
        };

        let bridge = BridgeConfig {
            idle_timeout: self.idle_timeout.map(Duration::from_secs),
            close_grace: Duration::from_millis(self.close_grace),
            ..Default::default()
        };

        let connect_timeout = (self.connect_timeout > 0)
            .then(|| Duration::from_secs(self.connect_timeout));

        ListenerConfig::new(listen_port, self.upstream_host.clone(), upstream_port)
            .listen_host(self.listen_host)
            .restart(restart)
            .bridge(bridge)
            .connect_timeout(connect_timeout)
    }
}
