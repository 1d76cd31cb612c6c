//! Socket introspection.
//!
//! Everything here operates on the raw OS handle of an established TCP
//! connection: pinning the kernel congestion-control algorithm, reading
//! `TCP_INFO` and BBR telemetry, and deriving a stable per-flow identifier.
//! On platforms without the capability every operation reports
//! [`Error::Unsupported`] and callers degrade to empty samples. Only
//! `set_cc` has side effects; all operations are safe to call concurrently
//! across distinct sockets.

use crate::model::{BBRInfo, TCPInfo};
use crate::proto::Error;

/// Portable alias for a socket handle. On non-unix targets no real handle is
/// available; [`NO_FD`] is passed around instead and every probe reports
/// `Unsupported`.
pub type SockFd = std::os::raw::c_int;

/// Placeholder handle used where the platform exposes none.
pub const NO_FD: SockFd = -1;

/// Requests the kernel switch this socket to the named congestion-control
/// algorithm. Rejected names and unsupported platforms surface as errors;
/// callers treat both as non-fatal.
pub fn set_cc(fd: SockFd, name: &str) -> Result<(), Error> {
    if fd < 0 {
        return Err(Error::Unsupported);
    }
    sys::set_cc(fd, name)
}

/// The congestion-control algorithm currently active on this socket.
pub fn get_cc(fd: SockFd) -> Result<String, Error> {
    if fd < 0 {
        return Err(Error::Unsupported);
    }
    sys::get_cc(fd)
}

/// Snapshot of the kernel's `tcp_info` for this socket.
pub fn tcp_info(fd: SockFd) -> Result<TCPInfo, Error> {
    if fd < 0 {
        return Err(Error::Unsupported);
    }
    sys::tcp_info(fd)
}

/// BBR bandwidth/min-RTT telemetry for this socket. Only meaningful while
/// BBR is the active algorithm.
pub fn bbr_info(fd: SockFd) -> Result<BBRInfo, Error> {
    if fd < 0 {
        return Err(Error::Unsupported);
    }
    sys::bbr_info(fd)
}

/// A stable string identifier for this TCP flow, used to name archival
/// records. Derived from the kernel socket cookie where available, otherwise
/// a locally unique random token.
pub fn flow_uuid(fd: SockFd) -> String {
    match sys::flow_cookie(fd) {
        Ok(cookie) => format!("mstream-{}-{:016x}", std::process::id(), cookie),
        Err(_) => {
            use rand::Rng;
            let token: u64 = rand::thread_rng().gen();
            format!("mstream-{}-r{:016x}", std::process::id(), token)
        }
    }
}

/// The socket handle under a client-side connection, which may or may not be
/// wrapped in TLS.
#[cfg(unix)]
pub fn client_stream_fd(
    stream: &tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
) -> SockFd {
    use std::os::fd::AsRawFd;
    use tokio_tungstenite::MaybeTlsStream;
    match stream {
        MaybeTlsStream::Plain(tcp) => tcp.as_raw_fd(),
        MaybeTlsStream::Rustls(tls) => tls.get_ref().0.as_raw_fd(),
        _ => NO_FD,
    }
}

#[cfg(not(unix))]
pub fn client_stream_fd(
    _stream: &tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
) -> SockFd {
    NO_FD
}

/// The local and remote addresses of a client-side connection, as strings.
pub fn client_stream_addrs(
    stream: &tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
) -> Option<(String, String)> {
    use tokio_tungstenite::MaybeTlsStream;
    let tcp = match stream {
        MaybeTlsStream::Plain(tcp) => tcp,
        MaybeTlsStream::Rustls(tls) => tls.get_ref().0,
        _ => return None,
    };
    let local = tcp.local_addr().ok()?;
    let peer = tcp.peer_addr().ok()?;
    Some((local.to_string(), peer.to_string()))
}

#[cfg(target_os = "linux")]
mod sys {
    use super::SockFd;
    use crate::model::{BBRInfo, TCPInfo};
    use crate::proto::Error;

    // From uapi/linux/tcp.h and asm-generic/socket.h; not all of these are
    // exported by the libc crate.
    const TCP_INFO: libc::c_int = 11;
    const TCP_CONGESTION: libc::c_int = 13;
    const TCP_CC_INFO: libc::c_int = 26;
    const SO_COOKIE: libc::c_int = 57;

    // Longest algorithm name the kernel accepts (TCP_CA_NAME_MAX).
    const CC_NAME_MAX: usize = 16;

    fn os_error() -> Error {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOPROTOOPT) | Some(libc::EOPNOTSUPP) => Error::Unsupported,
            _ => Error::Io(err),
        }
    }

    pub fn set_cc(fd: SockFd, name: &str) -> Result<(), Error> {
        let bytes = name.as_bytes();
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                TCP_CONGESTION,
                bytes.as_ptr() as *const libc::c_void,
                bytes.len() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(os_error());
        }
        Ok(())
    }

    pub fn get_cc(fd: SockFd) -> Result<String, Error> {
        let mut buf = [0u8; CC_NAME_MAX];
        let mut len = buf.len() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                TCP_CONGESTION,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(os_error());
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(len as usize);
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    pub fn tcp_info(fd: SockFd) -> Result<TCPInfo, Error> {
        let mut info = TCPInfo::default();
        // Only the kernel-layout prefix is readable; elapsed_time stays ours.
        let kernel_len = std::mem::size_of::<TCPInfo>() - std::mem::size_of::<i64>();
        let mut len = kernel_len as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                TCP_INFO,
                &mut info as *mut TCPInfo as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(os_error());
        }
        Ok(info)
    }

    #[repr(C)]
    #[derive(Default)]
    struct TcpBbrInfo {
        bw_lo: u32,
        bw_hi: u32,
        min_rtt: u32,
        pacing_gain: u32,
        cwnd_gain: u32,
    }

    pub fn bbr_info(fd: SockFd) -> Result<BBRInfo, Error> {
        let mut raw = TcpBbrInfo::default();
        let mut len = std::mem::size_of::<TcpBbrInfo>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_TCP,
                TCP_CC_INFO,
                &mut raw as *mut TcpBbrInfo as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(os_error());
        }
        Ok(BBRInfo {
            bw: ((raw.bw_hi as i64) << 32) | raw.bw_lo as i64,
            min_rtt: raw.min_rtt,
            pacing_gain: raw.pacing_gain,
            cwnd_gain: raw.cwnd_gain,
            elapsed_time: 0,
        })
    }

    pub fn flow_cookie(fd: SockFd) -> Result<u64, Error> {
        let mut cookie: u64 = 0;
        let mut len = std::mem::size_of::<u64>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                SO_COOKIE,
                &mut cookie as *mut u64 as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(os_error());
        }
        Ok(cookie)
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use super::SockFd;
    use crate::model::{BBRInfo, TCPInfo};
    use crate::proto::Error;

    pub fn set_cc(_fd: SockFd, _name: &str) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    pub fn get_cc(_fd: SockFd) -> Result<String, Error> {
        Err(Error::Unsupported)
    }

    pub fn tcp_info(_fd: SockFd) -> Result<TCPInfo, Error> {
        Err(Error::Unsupported)
    }

    pub fn bbr_info(_fd: SockFd) -> Result<BBRInfo, Error> {
        Err(Error::Unsupported)
    }

    pub fn flow_cookie(_fd: SockFd) -> Result<u64, Error> {
        Err(Error::Unsupported)
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn connected_pair() -> (std::net::TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let client = std::net::TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        (client, server)
    }

    #[test]
    fn get_cc_reports_an_algorithm() {
        let (client, _server) = connected_pair();
        let cc = get_cc(client.as_raw_fd()).expect("get_cc");
        assert!(!cc.is_empty());
    }

    #[test]
    fn tcp_info_is_readable_on_a_live_socket() {
        let (client, _server) = connected_pair();
        let info = tcp_info(client.as_raw_fd()).expect("tcp_info");
        // An established socket reports a positive MSS.
        assert!(info.snd_mss > 0 || info.rcv_mss > 0 || info.state > 0);
    }

    #[test]
    fn flow_uuid_is_stable_per_socket() {
        let (client, _server) = connected_pair();
        let a = flow_uuid(client.as_raw_fd());
        let b = flow_uuid(client.as_raw_fd());
        assert_eq!(a, b);
        assert!(a.starts_with("mstream-"));
    }

    #[test]
    fn invalid_fd_is_an_error() {
        assert!(get_cc(NO_FD).is_err());
        assert!(tcp_info(NO_FD).is_err());
    }
}
