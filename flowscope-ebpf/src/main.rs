#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::{
        bpf_sock_ops, BPF_SOCK_OPS_ACTIVE_ESTABLISHED_CB, BPF_SOCK_OPS_PASSIVE_ESTABLISHED_CB,
        BPF_SOCK_OPS_RTT_CB, BPF_SOCK_OPS_RTT_CB_FLAG, BPF_SOCK_OPS_STATE_CB,
        BPF_SOCK_OPS_STATE_CB_FLAG,
    },
    helpers::bpf_ktime_get_ns,
    macros::{map, sock_ops},
    maps::{HashMap, LruHashMap, RingBuf},
    programs::SockOpsContext,
};
use core::ptr;
use flowscope_common::{FlowSpec, TCP_SNAPSHOT_SIZE};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 4] = *b"GPL\0";

const AF_INET6: u32 = 10;

/// Rewritten at load time by userspace.
#[no_mangle]
static POLL_INTERVAL_NS: u64 = 1_000_000_000;

/// Flows of interest, populated by userspace on WatchFlow.
#[map]
static FLOWS: HashMap<FlowSpec, u8> = HashMap::with_max_entries(1024, 0);

/// Next RTT-callback emission deadline per flow, for in-kernel sampling
/// throttling.
#[map]
static NEXT_EMIT: LruHashMap<FlowSpec, u64> = LruHashMap::with_max_entries(1024, 0);

#[map]
static SAMPLES: RingBuf = RingBuf::with_byte_size(256 * 1024, 0);

/// sock_ops entry point.
///
/// All logic is kept in one function and record writes are done
/// field-by-field: compiler-generated `memcpy` / `memset` builtins land
/// in the `.text` ELF section, creating cross-section relocations that
/// aya 0.13.x cannot resolve for `sock_ops` sections.
#[sock_ops]
pub fn flowscope(ctx: SockOpsContext) -> u32 {
    if ctx.family() != AF_INET6 {
        return 0;
    }

    let key = FlowSpec {
        dst_port: u32::from_be(ctx.remote_port()),
        src_port: ctx.local_port(),
    };
    if unsafe { FLOWS.get(&key) }.is_none() {
        return 0;
    }

    match ctx.op() {
        BPF_SOCK_OPS_ACTIVE_ESTABLISHED_CB | BPF_SOCK_OPS_PASSIVE_ESTABLISHED_CB => {
            // Opt this socket into state-transition and RTT callbacks.
            let _ =
                ctx.set_cb_flags((BPF_SOCK_OPS_STATE_CB_FLAG | BPF_SOCK_OPS_RTT_CB_FLAG) as i32);
            emit(&ctx, &key, 0);
        }
        BPF_SOCK_OPS_STATE_CB => {
            emit(&ctx, &key, ctx.arg(1));
        }
        BPF_SOCK_OPS_RTT_CB => {
            // RTT callbacks fire per ACK; throttle to the configured
            // sampling interval.
            let now = unsafe { bpf_ktime_get_ns() };
            let due = match unsafe { NEXT_EMIT.get(&key) } {
                Some(next) => now >= *next,
                None => true,
            };
            if due {
                let interval = unsafe { ptr::read_volatile(&POLL_INTERVAL_NS) };
                let _ = NEXT_EMIT.insert(&key, &(now + interval), 0);
                emit(&ctx, &key, 0);
            }
        }
        _ => {}
    }

    0
}

#[inline(always)]
unsafe fn write_u16(p: *mut u8, off: usize, v: u16) {
    ptr::write_unaligned(p.add(off) as *mut u16, v);
}

#[inline(always)]
unsafe fn write_u32(p: *mut u8, off: usize, v: u32) {
    ptr::write_unaligned(p.add(off) as *mut u32, v);
}

#[inline(always)]
unsafe fn write_u64(p: *mut u8, off: usize, v: u64) {
    ptr::write_unaligned(p.add(off) as *mut u64, v);
}

/// Reserve one fixed-size record and fill the fields sock_ops exposes;
/// everything else stays zero. Volatile stores for the zeroing pass stop
/// LLVM from collapsing the loop into a `memset` call.
#[inline(always)]
fn emit(ctx: &SockOpsContext, key: &FlowSpec, new_state: u32) {
    let Some(mut buf) = SAMPLES.reserve::<[u8; TCP_SNAPSHOT_SIZE]>(0) else {
        return;
    };
    let p = buf.as_mut_ptr() as *mut u8;
    let ops: *const bpf_sock_ops = ctx.ops;

    unsafe {
        let mut off = 0;
        while off < TCP_SNAPSHOT_SIZE {
            ptr::write_volatile(p.add(off) as *mut u64, 0);
            off += 8;
        }

        write_u16(p, 0, key.src_port as u16);
        write_u16(p, 2, key.dst_port as u16);
        write_u32(p, 4, new_state);

        if (*ops).is_fullsock != 0 {
            ptr::write(p.add(8), (*ops).state as u8);
            write_u32(p, 24, (*ops).mss_cache); // snd_mss
            write_u32(p, 32, (*ops).packets_out); // unacked
            write_u32(p, 36, (*ops).sacked_out);
            write_u32(p, 40, (*ops).lost_out);
            write_u32(p, 44, (*ops).retrans_out);
            write_u32(p, 76, (*ops).srtt_us >> 3); // rtt
            write_u32(p, 84, (*ops).snd_ssthresh);
            write_u32(p, 88, (*ops).snd_cwnd);
            write_u64(p, 108, (*ops).total_retrans as u64);
            write_u64(p, 132, (*ops).bytes_acked);
            write_u64(p, 140, (*ops).bytes_received);
            write_u32(p, 148, (*ops).segs_out);
            write_u32(p, 152, (*ops).segs_in);
            write_u32(p, 160, (*ops).rtt_min); // min_rtt
            write_u32(p, 164, (*ops).data_segs_in);
            write_u32(p, 168, (*ops).data_segs_out);
        }
    }

    buf.submit(0);
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
