#![no_std]

/// Key into the kernel-side table of flows the sock_ops program should
/// report on.  Ports are widened to u32 to satisfy the 4-byte alignment
/// the verifier expects for map keys.
///
/// The sock_ops hook only sees port numbers for established sockets, so
/// the key deliberately carries no addresses: userspace computes its flow
/// hashes from ports alone for the push source.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FlowSpec {
    /// Destination (remote) port, host byte order.
    pub dst_port: u32,
    /// Source (local) port, host byte order.
    pub src_port: u32,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for FlowSpec {}

/// Size in bytes of one TCP snapshot record on the ring buffer.
///
/// The userspace decoder refuses any record that is not exactly this
/// long; the kernel program reserves exactly this much per sample.
pub const TCP_SNAPSHOT_SIZE: usize = 360;
