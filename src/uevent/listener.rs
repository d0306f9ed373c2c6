//! Uevent listener
//!
//! Owns the netlink socket udev publishes device events on and turns its
//! datagrams into [`DeviceEvent`]s. One listener reads one socket; reads are
//! never issued concurrently.

use super::decoder::{parse_device_event, DeviceEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;
use nix::sys::socket::{
    bind, recv, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Multicast group udev re-broadcasts processed events on
const UDEV_MONITOR_GROUP: u32 = 2;

const DEFAULT_PAGE_SIZE: usize = 4096;

// =============================================================================
// Socket
// =============================================================================

/// Datagram source the listener reads from
#[async_trait]
pub trait MonitorSocket: Send + Sync {
    /// Copy the pending datagram into `buf` without consuming it
    async fn peek(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Consume the pending datagram
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// NETLINK_KOBJECT_UEVENT socket bound to the udev group
pub struct NetlinkSocket {
    fd: AsyncFd<OwnedFd>,
}

impl NetlinkSocket {
    pub fn open() -> Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )?;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, UDEV_MONITOR_GROUP))?;
        info!("Listening for udev events on netlink group {}", UDEV_MONITOR_GROUP);

        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    async fn recv_with(&self, buf: &mut [u8], flags: MsgFlags) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                recv(inner.get_ref().as_raw_fd(), buf, flags).map_err(io::Error::from)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

#[async_trait]
impl MonitorSocket for NetlinkSocket {
    async fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv_with(buf, MsgFlags::MSG_PEEK).await
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv_with(buf, MsgFlags::empty()).await
    }
}

/// Host page size
pub fn page_size() -> usize {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|size| usize::try_from(size).ok())
        .unwrap_or(DEFAULT_PAGE_SIZE)
}

// =============================================================================
// Listener
// =============================================================================

/// Frames datagrams from a [`MonitorSocket`] and decodes them
pub struct Listener<S: MonitorSocket> {
    socket: S,
    page_size: usize,
    closed: watch::Sender<bool>,
}

impl<S: MonitorSocket> Listener<S> {
    pub fn new(socket: S) -> Self {
        Self::with_page_size(socket, page_size())
    }

    pub fn with_page_size(socket: S, page_size: usize) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            socket,
            page_size: page_size.max(1),
            closed,
        }
    }

    /// Stop the listener; pending and future reads fail with `ListenerClosed`
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Peek the pending datagram, growing the buffer a page at a time until
    /// the whole message fits
    async fn msg_peek(&self, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        let mut buf = vec![0u8; self.page_size];

        loop {
            if *closed.borrow_and_update() {
                return Err(Error::ListenerClosed);
            }

            let n = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = closed.changed() => return Err(Error::ListenerClosed),
                result = self.socket.peek(&mut buf) => result?,
            };

            if n < buf.len() {
                buf.truncate(n);
                return Ok(buf);
            }
            buf.resize(buf.len() + self.page_size, 0);
        }
    }

    /// Consume exactly `buf.len()` bytes
    async fn msg_read(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<()> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(Error::ListenerClosed);
        }

        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = closed.changed() => return Err(Error::ListenerClosed),
            result = self.socket.read(buf) => result?,
        };

        if n != buf.len() {
            return Err(Error::ShortRead {
                expected: buf.len(),
                got: n,
            });
        }
        Ok(())
    }

    /// Next complete raw message
    pub async fn read_msg(&self, cancel: &CancellationToken) -> Result<Vec<u8>> {
        loop {
            let mut buf = self.msg_peek(cancel).await?;
            if buf.is_empty() {
                // Not fully delivered yet
                tokio::task::yield_now().await;
                continue;
            }
            self.msg_read(&mut buf, cancel).await?;
            return Ok(buf);
        }
    }

    /// Next block device event, skipping other subsystems and dropping
    /// invalid events
    pub async fn next_event(&self, cancel: &CancellationToken) -> Result<DeviceEvent> {
        loop {
            let msg = self.read_msg(cancel).await?;
            match parse_device_event(&msg) {
                Ok(event) => return Ok(event),
                Err(Error::NonDeviceEvent) => trace!("Skipping non-block uevent"),
                Err(e) if e.is_framing() => return Err(e),
                Err(e) => warn!("Dropping uevent: {}", e),
            }
        }
    }

    /// Forward events to `events` until cancelled, closed, or a framing error
    pub async fn run(&self, cancel: CancellationToken, events: mpsc::Sender<DeviceEvent>) -> Result<()> {
        loop {
            let event = match self.next_event(&cancel).await {
                Ok(event) => event,
                Err(Error::Cancelled) | Err(Error::ListenerClosed) => {
                    debug!("Uevent listener stopped");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            debug!(
                "Uevent {} {} ({})",
                event.action,
                event.dev_path,
                event.major_minor()
            );
            if events.send(event).await.is_err() {
                debug!("Uevent receiver dropped, stopping listener");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::uevent::decoder::{encode, Action};
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted datagrams; blocks forever once drained
    #[derive(Default)]
    pub(crate) struct ScriptedSocket {
        pub messages: Mutex<VecDeque<Vec<u8>>>,
        pub peeks: AtomicUsize,
        /// Bytes to return from the next read instead of the message length
        pub short_read: Mutex<Option<usize>>,
    }

    impl ScriptedSocket {
        pub fn with(messages: Vec<Vec<u8>>) -> Self {
            Self {
                messages: Mutex::new(messages.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl MonitorSocket for ScriptedSocket {
        async fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.peeks.fetch_add(1, Ordering::SeqCst);
            let front = self.messages.lock().front().cloned();
            match front {
                Some(msg) => {
                    let n = msg.len().min(buf.len());
                    buf[..n].copy_from_slice(&msg[..n]);
                    Ok(n)
                }
                None => futures::future::pending().await,
            }
        }

        async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            let msg = self.messages.lock().pop_front().unwrap_or_default();
            let n = msg.len().min(buf.len());
            buf[..n].copy_from_slice(&msg[..n]);
            Ok(self.short_read.lock().take().unwrap_or(n))
        }
    }

    fn block_event(action: &str, name: &str) -> Vec<u8> {
        let properties: BTreeMap<String, String> = [
            ("ACTION", action.to_string()),
            ("SUBSYSTEM", "block".to_string()),
            ("DEVPATH", format!("/devices/virtual/block/{}", name)),
            ("MAJOR", "7".to_string()),
            ("MINOR", "0".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        encode(&properties)
    }

    #[tokio::test]
    async fn test_peek_grows_buffer_for_large_messages() {
        let mut large = block_event("add", "loop0");
        large.extend(std::iter::repeat(b'X').take(100));
        large.push(0);
        let expected = large.clone();

        let listener = Listener::with_page_size(ScriptedSocket::with(vec![large]), 32);
        let msg = listener.read_msg(&CancellationToken::new()).await.unwrap();

        assert_eq!(msg, expected);
        assert!(listener.socket.peeks.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn test_short_read_is_fatal() {
        let socket = ScriptedSocket::with(vec![block_event("add", "loop0")]);
        *socket.short_read.lock() = Some(3);
        let listener = Listener::with_page_size(socket, 4096);

        assert_matches!(
            listener.read_msg(&CancellationToken::new()).await,
            Err(Error::ShortRead { got: 3, .. })
        );
    }

    #[tokio::test]
    async fn test_zero_length_message_is_retried() {
        let socket = ScriptedSocket::with(vec![Vec::new(), block_event("add", "loop1")]);
        let listener = Listener::with_page_size(socket, 4096);

        // The empty datagram is peeked, never consumed by the listener, and
        // only drained here to let the next one through.
        let cancel = CancellationToken::new();
        let handle = {
            let listener = Arc::new(listener);
            let reader = listener.clone();
            let task = tokio::spawn(async move { reader.read_msg(&cancel).await });
            tokio::task::yield_now().await;
            listener.socket.messages.lock().retain(|m| !m.is_empty());
            task
        };

        let msg = handle.await.unwrap().unwrap();
        assert_eq!(msg, block_event("add", "loop1"));
    }

    #[tokio::test]
    async fn test_cancellation_and_close() {
        let listener = Listener::with_page_size(ScriptedSocket::default(), 4096);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_matches!(listener.read_msg(&cancel).await, Err(Error::Cancelled));

        let listener = Arc::new(Listener::with_page_size(ScriptedSocket::default(), 4096));
        let reader = listener.clone();
        let task = tokio::spawn(async move { reader.read_msg(&CancellationToken::new()).await });
        tokio::task::yield_now().await;
        listener.close();
        assert_matches!(task.await.unwrap(), Err(Error::ListenerClosed));
    }

    #[tokio::test]
    async fn test_run_skips_non_block_and_invalid_events() {
        let mut usb = BTreeMap::new();
        usb.insert("ACTION".to_string(), "add".to_string());
        usb.insert("SUBSYSTEM".to_string(), "usb".to_string());

        let socket = ScriptedSocket::with(vec![
            encode(&usb),
            block_event("bind", "loop2"),
            block_event("remove", "loop3"),
        ]);
        let listener = Listener::with_page_size(socket, 4096);
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let stop = cancel.clone();
        let (result, event) = tokio::join!(listener.run(cancel, tx), async move {
            let event = rx.recv().await;
            stop.cancel();
            event
        });

        result.unwrap();
        let event = event.unwrap();
        assert_eq!(event.action, Action::Remove);
        assert_eq!(event.dev_path, "/dev/loop3");
    }

    #[tokio::test]
    async fn test_framing_error_ends_run() {
        let mut bad = block_event("add", "loop0");
        bad[8] = 0;
        let listener = Listener::with_page_size(ScriptedSocket::with(vec![bad]), 4096);
        let (tx, _rx) = mpsc::channel(1);
        assert_matches!(
            listener.run(CancellationToken::new(), tx).await,
            Err(Error::MagicMismatch { .. })
        );
    }
}
