use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::wire::channel_params::ChannelParams;
use crate::wire::root_layer::ROOT_OVERHEAD;

pub const SDT_MULTICAST_PORT: u16 = 5568;

/// MAK timeout as a fraction of the channel's expiry
pub const MAK_TIMEOUT_FACTOR: f64 = 0.1;
pub const MAK_MAX_RETRIES: u8 = 2;
/// initial timeout for JOIN retries, doubled with every retry
pub const AD_HOC_TIMEOUT: Duration = Duration::from_millis(200);
pub const RECIPROCAL_TIMEOUT_FACTOR: f64 = 0.2;
pub const MIN_EXPIRY_TIME: Duration = Duration::from_secs(2);
pub const NAK_TIMEOUT_FACTOR: f64 = 0.1;
pub const NAK_MAX_RETRIES: u8 = 2;
pub const NAK_HOLDOFF_INTERVAL: Duration = Duration::from_millis(2);
pub const NAK_MAX_TIME: Duration = Duration::from_millis(20);
pub const NAK_BLANKTIME: Duration = Duration::from_millis(6);
pub const DEFAULT_NAK_MODULUS: u16 = 50;

#[derive(Debug, Clone)]
pub struct SdtConfig {
    /// The address the end point's socket binds to. Engine tests don't use it.
    pub self_addr: SocketAddr,

    /// This is the maximum size of UDP payload that SDT sends. Wrappers are filled up to this
    ///  size, and resent wrappers are coalesced into datagrams of at most this size.
    ///
    /// With full Ethernet frames and no optional IP headers, this is `1500 - 20 - 8 = 1472`
    ///  for IPv4 and `1500 - 40 - 8 = 1452` for IPv6. SDT does not fragment, so choosing this
    ///  too big causes datagrams to be dropped on routes with smaller frames.
    pub max_packet_size: usize,

    /// parameters for channels opened without explicit parameters
    pub default_channel_params: ChannelParams,
    /// advertised in JOIN and CHANNEL_PARAMS, in seconds
    pub adhoc_expiry: u8,

    /// number of members asked to acknowledge by a single round-robin MAK directive
    pub mak_span: u16,
    /// members acknowledge unsolicited after this many reliable wrappers; 0 disables this
    pub mak_threshold: u16,
    /// the nominal keep-alive interval is the channel's expiry divided by this
    pub keepalives_per_expiry: u32,

    /// number of JOIN retransmissions before giving up
    pub join_retries: u8,
    pub join_timeout: Duration,

    pub nak_blank_time: Duration,

    /// refuse JOINs for channels with a multicast destination address
    pub unicast_only: bool,
    /// allow more than one local component on this engine
    pub allow_multiple_components: bool,
    /// when a member that was added locally becomes a full member, connect all registered
    ///  client protocols
    pub auto_connect: bool,

    pub max_members: usize,
    pub max_local_channels: usize,
}

impl SdtConfig {
    pub fn new(self_addr: SocketAddr) -> SdtConfig {
        SdtConfig {
            self_addr,
            max_packet_size: 1472,
            default_channel_params: ChannelParams {
                expiry: Duration::from_secs(15),
                nak_outbound: false,
                nak_holdoff: NAK_HOLDOFF_INTERVAL,
                nak_modulus: DEFAULT_NAK_MODULUS,
                nak_max_wait: NAK_MAX_TIME,
            },
            adhoc_expiry: 15,
            mak_span: 8,
            mak_threshold: 16,
            keepalives_per_expiry: 3,
            join_retries: 3,
            join_timeout: AD_HOC_TIMEOUT,
            nak_blank_time: NAK_BLANKTIME,
            unicast_only: false,
            allow_multiple_components: false,
            auto_connect: true,
            max_members: 4096,
            max_local_channels: 1024,
        }
    }

    /// IPv4 with end-to-end full Ethernet MTU, listening on the SDT port on all interfaces
    pub fn default_ipv4() -> SdtConfig {
        Self::new(SocketAddr::from(([0, 0, 0, 0], SDT_MULTICAST_PORT)))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_packet_size < ROOT_OVERHEAD + 100 {
            bail!("max packet size {} is too small", self.max_packet_size);
        }
        if self.max_packet_size > 0x0fff {
            bail!("max packet size {} exceeds what a short PDU length can represent", self.max_packet_size);
        }
        if self.default_channel_params.expiry < MIN_EXPIRY_TIME {
            bail!("channel expiry must be at least {:?}", MIN_EXPIRY_TIME);
        }
        if self.default_channel_params.expiry.as_secs() > u8::MAX as u64 {
            bail!("channel expiry must be at most {} seconds", u8::MAX);
        }
        if self.default_channel_params.nak_modulus == 0 {
            bail!("NAK modulus must not be 0");
        }
        if self.mak_span == 0 {
            bail!("MAK span must be at least 1");
        }
        if self.keepalives_per_expiry == 0 {
            bail!("there must be at least one keep-alive per expiry interval");
        }
        if self.max_members == 0 || self.max_local_channels == 0 {
            bail!("limits must be positive");
        }
        Ok(())
    }

    pub fn mak_timeout(expiry: Duration) -> Duration {
        expiry.mul_f64(MAK_TIMEOUT_FACTOR)
    }

    pub fn nak_timeout(expiry: Duration) -> Duration {
        expiry.mul_f64(NAK_TIMEOUT_FACTOR)
    }

    pub fn reciprocal_timeout(expiry: Duration) -> Duration {
        expiry.mul_f64(RECIPROCAL_TIMEOUT_FACTOR)
    }

    pub fn keepalive_interval(&self, expiry: Duration) -> Duration {
        expiry / self.keepalives_per_expiry
    }
}
