//! Raw ARP I/O: opening a filtered raw socket, and transmitting a probe
//! or an announcement.
//!
//! Construction and transmission of ARP frames on the wire, and raw
//! socket creation with its kernel packet filter, are primitives the
//! state machine calls rather than logic it owns. This module supplies a
//! concrete, Linux `AF_PACKET` implementation of those primitives so the
//! crate is runnable end to end; the state machine in `state.rs` only
//! ever calls through the functions below, never touches `libc::socket`
//! itself.

use crate::errno::{Errno, Result};
use crate::types::{Ipv4Addr, MacAddr};
use std::os::unix::io::RawFd;

const ETH_P_ARP: u16 = 0x0806;
const ARPHRD_ETHER: u16 = 1;
const ARPOP_REQUEST: u16 = 1;
const ETH_ALEN: usize = 6;

/// Builds an Ethernet/IPv4 ARP frame's 28-byte payload, matching
/// `classify::ARP_FRAME_LEN`.
fn build_arp_payload(sha: MacAddr, spa: Ipv4Addr, tha: MacAddr, tpa: Ipv4Addr) -> [u8; 28] {
    let mut buf = [0u8; 28];
    buf[0..2].copy_from_slice(&ARPHRD_ETHER.to_be_bytes());
    buf[2..4].copy_from_slice(&ETH_P_ARP_TYPE.to_be_bytes());
    buf[4] = ETH_ALEN as u8;
    buf[5] = 4;
    buf[6..8].copy_from_slice(&ARPOP_REQUEST.to_be_bytes());
    buf[8..14].copy_from_slice(&sha.octets());
    buf[14..18].copy_from_slice(&spa.octets());
    buf[18..24].copy_from_slice(&tha.octets());
    buf[24..28].copy_from_slice(&tpa.octets());
    buf
}

// ARP's protocol-type field uses the same value space as EtherType, 0x0800
// for IPv4; named separately here to avoid confusing it with the Ethernet
// frame's own EtherType (ETH_P_ARP) used in the sockaddr_ll below.
const ETH_P_ARP_TYPE: u16 = 0x0800;

fn sockaddr_ll_for(ifindex: i32) -> libc::sockaddr_ll {
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = ETH_P_ARP.to_be();
    addr.sll_ifindex = ifindex;
    addr.sll_halen = ETH_ALEN as u8;
    addr
}

fn broadcast_sockaddr_ll(ifindex: i32) -> libc::sockaddr_ll {
    let mut addr = sockaddr_ll_for(ifindex);
    addr.sll_addr[..ETH_ALEN].copy_from_slice(&[0xff; ETH_ALEN]);
    addr
}

/// Opens a raw `AF_PACKET` socket bound to `ifindex`, filtered (via a
/// classic BPF program) to ARP frames whose sender- or target-protocol
/// address equals `ipv4` and whose sender hardware address is not `mac`.
/// The engine's "any delivered frame in a pre-bound state is a conflict"
/// rule depends on this filter.
pub fn open_raw_arp_socket(ifindex: i32, ipv4: Ipv4Addr, mac: MacAddr) -> Result<RawFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            (ETH_P_ARP as i32).to_be(),
        )
    };
    let fd = Errno::result(fd)?;

    let bpf = arp_filter_program(ipv4, mac);
    let prog = libc::sock_fprog {
        len: bpf.len() as u16,
        filter: bpf.as_ptr() as *mut libc::sock_filter,
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            (&prog as *const libc::sock_fprog).cast(),
            std::mem::size_of::<libc::sock_fprog>() as u32,
        )
    };
    if let Err(e) = Errno::result(ret) {
        unsafe { libc::close(fd) };
        return Err(e);
    }

    let addr = sockaddr_ll_for(ifindex);
    let ret = unsafe {
        libc::bind(
            fd,
            (&addr as *const libc::sockaddr_ll).cast(),
            std::mem::size_of::<libc::sockaddr_ll>() as u32,
        )
    };
    if let Err(e) = Errno::result(ret) {
        unsafe { libc::close(fd) };
        return Err(e);
    }

    Ok(fd)
}

/// A classic-BPF program equivalent to: accept iff
/// `(spa == ipv4 || tpa == ipv4) && sha != mac`. This is the filter that
/// keeps the "any delivered frame in a pre-bound state is a conflict"
/// rule in `state.rs` sound — without it, unrelated ARP traffic anywhere
/// on the segment would reach the socket and be misread as a conflict.
/// Real deployments (and `systemd-networkd`) also compile in a
/// htype/ptype/hlen/plen check; `classify::ArpFrame::parse` re-validates
/// those fields on every frame this filter lets through, so skipping them
/// here only costs a slightly larger accepted volume, not correctness.
///
/// The socket is bound `SOCK_DGRAM`, so the kernel strips the link-layer
/// header before the filter runs: offset 0 is the ARP header itself, the
/// same layout `classify::ArpFrame` parses.
fn arp_filter_program(ipv4: Ipv4Addr, mac: MacAddr) -> Vec<libc::sock_filter> {
    const SPA_OFFSET: u32 = 14;
    const TPA_OFFSET: u32 = 24;
    const SHA_HI_OFFSET: u32 = 8;
    const SHA_LO_OFFSET: u32 = 12;

    let octets = mac.octets();
    let mac_hi = u32::from_be_bytes([octets[0], octets[1], octets[2], octets[3]]);
    let mac_lo = u16::from_be_bytes([octets[4], octets[5]]) as u32;
    let ipv4_k = ipv4.to_be_u32();

    vec![
        // 0: A = spa
        bpf_stmt(libc::BPF_LD | libc::BPF_W | libc::BPF_ABS, SPA_OFFSET),
        // 1: spa == ipv4 ? jump to the sha check (4) : fall through to the tpa check (2)
        bpf_jump(libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K, ipv4_k, 2, 0),
        // 2: A = tpa
        bpf_stmt(libc::BPF_LD | libc::BPF_W | libc::BPF_ABS, TPA_OFFSET),
        // 3: tpa == ipv4 ? fall through to the sha check (4) : reject (9)
        bpf_jump(libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K, ipv4_k, 0, 5),
        // 4: A = sha[0..4]
        bpf_stmt(libc::BPF_LD | libc::BPF_W | libc::BPF_ABS, SHA_HI_OFFSET),
        // 5: sha_hi == mac_hi ? check the low half (6) : accept (8), sha already != mac
        bpf_jump(libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K, mac_hi, 0, 2),
        // 6: A = sha[4..6]
        bpf_stmt(libc::BPF_LD | libc::BPF_H | libc::BPF_ABS, SHA_LO_OFFSET),
        // 7: sha_lo == mac_lo ? reject (9), this is our own frame : accept (8)
        bpf_jump(libc::BPF_JMP | libc::BPF_JEQ | libc::BPF_K, mac_lo, 1, 0),
        // 8: accept
        bpf_stmt(libc::BPF_RET | libc::BPF_K, 0xffff_ffff),
        // 9: reject
        bpf_stmt(libc::BPF_RET | libc::BPF_K, 0),
    ]
}

fn bpf_stmt(code: u32, k: u32) -> libc::sock_filter {
    bpf_jump(code, k, 0, 0)
}

fn bpf_jump(code: u32, k: u32, jt: u8, jf: u8) -> libc::sock_filter {
    libc::sock_filter {
        code: code as u16,
        jt,
        jf,
        k,
    }
}

/// Transmits an ARP probe: SPA = 0, TPA = `ipv4`, SHA = `mac`, THA = 0.
pub fn send_probe(fd: RawFd, ifindex: i32, ipv4: Ipv4Addr, mac: MacAddr) -> Result<()> {
    let payload = build_arp_payload(mac, Ipv4Addr::UNSPECIFIED, MacAddr::ZERO, ipv4);
    send_arp_frame(fd, ifindex, &payload)
}

/// Transmits a gratuitous ARP: SPA = TPA = `ipv4`, SHA = `mac`.
pub fn send_announcement(fd: RawFd, ifindex: i32, ipv4: Ipv4Addr, mac: MacAddr) -> Result<()> {
    let payload = build_arp_payload(mac, ipv4, MacAddr::ZERO, ipv4);
    send_arp_frame(fd, ifindex, &payload)
}

fn send_arp_frame(fd: RawFd, ifindex: i32, payload: &[u8; 28]) -> Result<()> {
    let addr = broadcast_sockaddr_ll(ifindex);
    let ret = unsafe {
        libc::sendto(
            fd,
            payload.as_ptr().cast(),
            payload.len(),
            0,
            (&addr as *const libc::sockaddr_ll).cast(),
            std::mem::size_of::<libc::sockaddr_ll>() as u32,
        )
    };
    Errno::result(ret).map(drop)
}

/// Reads one frame off `fd` into `buf`, returning the number of bytes
/// read. `Err` with [`Errno::would_block_or_interrupted`] means no frame is
/// currently available — not a failure of the socket itself.
pub fn recv_frame(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
    Errno::result(n).map(|n| n as usize)
}

/// Closes a socket opened by [`open_raw_arp_socket`].
pub fn close_socket(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

/// Resolves an interface name to its index, for callers that only know the
/// name (`if_nametoindex(3)`); the engine itself only ever stores and uses
/// the numeric `ifindex`.
pub fn if_nametoindex(name: &str) -> Result<i32> {
    use std::ffi::CString;
    let cname = CString::new(name).map_err(|_| Errno::EINVAL)?;
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        Err(Errno::last())
    } else {
        Ok(idx as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_payload_has_zero_sender_protocol_address() {
        let mac = MacAddr::new([2, 0, 0, 0, 0, 1]);
        let ip = Ipv4Addr::new(169, 254, 5, 7);
        let payload = build_arp_payload(mac, Ipv4Addr::UNSPECIFIED, MacAddr::ZERO, ip);
        assert_eq!(&payload[14..18], &[0, 0, 0, 0]);
        assert_eq!(&payload[24..28], &ip.octets());
        assert_eq!(payload[6..8], ARPOP_REQUEST.to_be_bytes());
    }

    #[test]
    fn announcement_payload_has_matching_sender_and_target() {
        let mac = MacAddr::new([2, 0, 0, 0, 0, 1]);
        let ip = Ipv4Addr::new(169, 254, 5, 7);
        let payload = build_arp_payload(mac, ip, MacAddr::ZERO, ip);
        assert_eq!(&payload[14..18], &ip.octets());
        assert_eq!(&payload[24..28], &ip.octets());
        assert_eq!(&payload[8..14], &mac.octets());
    }

    /// Interprets the subset of classic BPF `arp_filter_program` emits
    /// (`LD W/H ABS`, `JMP JEQ K`, `RET K`) against a packet buffer.
    fn bpf_run(prog: &[libc::sock_filter], packet: &[u8]) -> u32 {
        let mut pc = 0usize;
        let mut acc: u32 = 0;
        loop {
            let ins = prog[pc];
            let class = ins.code as u32 & 0x07;
            match class {
                0x00 => {
                    // BPF_LD
                    let size = ins.code as u32 & 0x18;
                    let off = ins.k as usize;
                    acc = match size {
                        0x00 => u32::from_be_bytes(packet[off..off + 4].try_into().unwrap()),
                        0x08 => u16::from_be_bytes(packet[off..off + 2].try_into().unwrap()) as u32,
                        other => panic!("unsupported BPF load size {other}"),
                    };
                    pc += 1;
                }
                0x05 => {
                    // BPF_JMP
                    if acc == ins.k {
                        pc += 1 + ins.jt as usize;
                    } else {
                        pc += 1 + ins.jf as usize;
                    }
                }
                0x06 => return ins.k, // BPF_RET
                other => panic!("unsupported BPF instruction class {other}"),
            }
        }
    }

    fn arp_frame(sha: [u8; 6], spa: [u8; 4], tpa: [u8; 4]) -> Vec<u8> {
        let mut v = vec![0u8; 28];
        v[8..14].copy_from_slice(&sha);
        v[14..18].copy_from_slice(&spa);
        v[24..28].copy_from_slice(&tpa);
        v
    }

    #[test]
    fn filter_rejects_unrelated_traffic() {
        let ipv4 = Ipv4Addr::new(169, 254, 5, 7);
        let mac = MacAddr::new([2, 0, 0, 0, 0, 1]);
        let prog = arp_filter_program(ipv4, mac);
        let frame = arp_frame([2, 0, 0, 0, 0, 2], [10, 0, 0, 1], [10, 0, 0, 2]);
        assert_eq!(bpf_run(&prog, &frame), 0);
    }

    #[test]
    fn filter_accepts_sender_protocol_address_match() {
        let ipv4 = Ipv4Addr::new(169, 254, 5, 7);
        let mac = MacAddr::new([2, 0, 0, 0, 0, 1]);
        let prog = arp_filter_program(ipv4, mac);
        let frame = arp_frame([2, 0, 0, 0, 0, 2], [169, 254, 5, 7], [0, 0, 0, 0]);
        assert_eq!(bpf_run(&prog, &frame), 0xffff_ffff);
    }

    #[test]
    fn filter_accepts_target_protocol_address_match() {
        let ipv4 = Ipv4Addr::new(169, 254, 5, 7);
        let mac = MacAddr::new([2, 0, 0, 0, 0, 1]);
        let prog = arp_filter_program(ipv4, mac);
        let frame = arp_frame([2, 0, 0, 0, 0, 2], [0, 0, 0, 0], [169, 254, 5, 7]);
        assert_eq!(bpf_run(&prog, &frame), 0xffff_ffff);
    }

    #[test]
    fn filter_rejects_own_transmitted_frame() {
        let ipv4 = Ipv4Addr::new(169, 254, 5, 7);
        let mac = MacAddr::new([2, 0, 0, 0, 0, 1]);
        let prog = arp_filter_program(ipv4, mac);
        let frame = arp_frame(mac.octets(), [169, 254, 5, 7], [169, 254, 5, 7]);
        assert_eq!(bpf_run(&prog, &frame), 0);
    }
}
