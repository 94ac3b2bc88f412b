//! Pipe session: one interface, one transport, one connection cycle
//!
//! Two pump tasks copy packets between the interface and the transport.
//! Both block on reads bounded by the poll interval so they notice
//! cancellation and the shared failure flag without a wakeup channel. The
//! first pump to hit an I/O error sets the flag; the other one sees it on
//! its next poll and exits too.

use crate::device::NetworkInterface;
use crate::stats::TrafficStats;
use crate::SessionError;
use quictun_control::{negotiate, ControlChannel, ControlResult, Role, RouteTable};
use quictun_proto::RouteSet;
use quictun_transport::{CloseReason, Transport, TransportOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Pump tuning
#[derive(Debug, Clone)]
pub struct PumpOptions {
    /// Upper bound on how long a pump blocks before checking for shutdown
    pub poll_interval: Duration,
    pub stats_interval: Duration,
    /// Largest packet a pump can carry; must not exceed the transport's max payload
    pub buffer_size: usize,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            stats_interval: Duration::from_secs(10),
            buffer_size: TransportOptions::default().max_payload(),
        }
    }
}

/// Session-wide failure marker; once set it stays set
#[derive(Debug, Clone, Default)]
pub struct FailureFlag(Arc<AtomicBool>);

impl FailureFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct PipeSession {
    device: Arc<dyn NetworkInterface>,
    transport: Arc<dyn Transport>,
    control: ControlChannel,
    routes: RouteSet,
    failure: FailureFlag,
    stats: Arc<TrafficStats>,
    options: PumpOptions,
}

impl PipeSession {
    pub fn new(
        device: Arc<dyn NetworkInterface>,
        transport: Arc<dyn Transport>,
        routes: RouteSet,
        stats: Arc<TrafficStats>,
        options: PumpOptions,
    ) -> Self {
        Self {
            device,
            control: ControlChannel::new(transport.clone()),
            transport,
            routes,
            failure: FailureFlag::new(),
            stats,
            options,
        }
    }

    pub fn failure(&self) -> &FailureFlag {
        &self.failure
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Exchange routes with the peer, installing theirs into `table`
    pub async fn negotiate<R>(&self, role: Role, table: &R) -> ControlResult<()>
    where
        R: RouteTable + ?Sized,
    {
        negotiate(&self.control, role, &self.routes, table).await
    }

    /// Point-in-time transport and traffic counters
    pub fn stats_line(&self) -> String {
        format!("Transport Stats: {} | {}", self.transport.stats(), self.stats)
    }

    /// Pump packets until a pump fails or `cancel` fires
    ///
    /// The transport is closed before this returns. A shutdown is not an
    /// error; a pump failure is reported as [`SessionError::Pump`].
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let pump = Pump {
            device: self.device.clone(),
            transport: self.transport.clone(),
            failure: self.failure.clone(),
            cancel: cancel.clone(),
            stats: self.stats.clone(),
            poll_interval: self.options.poll_interval,
            buffer_size: self.options.buffer_size,
        };

        let done = cancel.child_token();
        let upload = tokio::spawn(interface_to_transport(pump.clone()));
        let download = tokio::spawn(transport_to_interface(pump));
        let reporter = tokio::spawn(report_stats(
            self.transport.clone(),
            self.stats.clone(),
            self.failure.clone(),
            done.clone(),
            self.options.stats_interval,
        ));
        info!("Link UP!");

        let (upload, download) = tokio::join!(upload, download);
        done.cancel();
        let _ = reporter.await;

        self.close().await;
        info!("Link DOWN!");

        let failures: Vec<String> = [upload, download]
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(failure) => failure,
                Err(e) => Some(format!("pump task panicked: {}", e)),
            })
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SessionError::Pump(failures.join("; ")))
        }
    }

    /// Close the transport; safe to call more than once
    pub async fn close(&self) {
        self.transport.close(CloseReason::Graceful).await;
    }
}

#[derive(Clone)]
struct Pump {
    device: Arc<dyn NetworkInterface>,
    transport: Arc<dyn Transport>,
    failure: FailureFlag,
    cancel: CancellationToken,
    stats: Arc<TrafficStats>,
    poll_interval: Duration,
    buffer_size: usize,
}

impl Pump {
    /// True when the pump should stop before its next read
    fn should_stop(&self, tag: &str) -> bool {
        if self.cancel.is_cancelled() {
            info!("{} cancelled", tag);
            return true;
        }
        if self.failure.is_set() {
            debug!("{}: other party may have failed, stopping", tag);
            return true;
        }
        false
    }
}

/// Returns the failure that stopped the pump, if any
async fn interface_to_transport(pump: Pump) -> Option<String> {
    let tag = "tun dev -> transport";
    info!("{} started", tag);
    let mut buffer = vec![0u8; pump.buffer_size];

    let failure = loop {
        if pump.should_stop(tag) {
            break None;
        }

        let len = match timeout(pump.poll_interval, pump.device.read_packet(&mut buffer)).await {
            Err(_) => continue,
            Ok(Ok(len)) => len,
            Ok(Err(e)) => {
                error!("{} read error: {}", tag, e);
                break Some(format!("interface read: {}", e));
            }
        };
        if len == 0 {
            continue;
        }

        if let Err(e) = pump.transport.write(&buffer[..len]).await {
            error!("{} write transport error: {}", tag, e);
            break Some(format!("transport write: {}", e));
        }
        trace!("{} {} bytes", tag, len);
        pump.stats.add_uploaded(len as u64);
    };

    if failure.is_some() {
        pump.failure.set();
    }
    info!("{} ended", tag);
    failure
}

async fn transport_to_interface(pump: Pump) -> Option<String> {
    let tag = "transport -> tun dev";
    info!("{} started", tag);
    let mut buffer = vec![0u8; pump.buffer_size];

    let failure = loop {
        if pump.should_stop(tag) {
            break None;
        }

        let len = match timeout(pump.poll_interval, pump.transport.read(&mut buffer)).await {
            Err(_) => continue,
            Ok(Ok(len)) => len,
            Ok(Err(e)) => {
                error!("{} read error: {}", tag, e);
                break Some(format!("transport read: {}", e));
            }
        };

        if let Err(e) = pump.device.write_packet(&buffer[..len]).await {
            error!("{} write TUN error: {}", tag, e);
            break Some(format!("interface write: {}", e));
        }
        trace!("{} {} bytes", tag, len);
        pump.stats.add_downloaded(len as u64);
    };

    if failure.is_some() {
        pump.failure.set();
    }
    info!("{} ended", tag);
    failure
}

async fn report_stats(
    transport: Arc<dyn Transport>,
    stats: Arc<TrafficStats>,
    failure: FailureFlag,
    done: CancellationToken,
    interval: Duration,
) {
    debug!("Stats reporter started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while !failure.is_set() {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = ticker.tick() => {
                info!("Transport Stats: {} | {}", transport.stats(), stats);
            }
        }
    }
    debug!("Stats reporter stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use quictun_transport::{
        BoxedReader, BoxedWriter, MuxTransport, NullCloser, TransportError, TransportOptions,
    };
    use std::io;
    use tokio::sync::{mpsc, Mutex};

    /// In-memory interface: packets pushed into `inject` come out of
    /// `read_packet`, packets written show up on `written`
    pub(crate) struct FakeInterface {
        inbound: Mutex<mpsc::UnboundedReceiver<io::Result<Vec<u8>>>>,
        outbound: mpsc::UnboundedSender<Vec<u8>>,
    }

    pub(crate) struct FakeInterfaceHandle {
        pub(crate) inject: mpsc::UnboundedSender<io::Result<Vec<u8>>>,
        pub(crate) written: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    impl FakeInterface {
        pub(crate) fn new() -> (Arc<Self>, FakeInterfaceHandle) {
            let (inject, inbound) = mpsc::unbounded_channel();
            let (outbound, written) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    inbound: Mutex::new(inbound),
                    outbound,
                }),
                FakeInterfaceHandle { inject, written },
            )
        }
    }

    #[async_trait]
    impl NetworkInterface for FakeInterface {
        fn name(&self) -> &str {
            "fake0"
        }

        async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inbound = self.inbound.lock().await;
            match inbound.recv().await {
                Some(Ok(packet)) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok(packet.len())
                }
                Some(Err(e)) => Err(e),
                None => std::future::pending().await,
            }
        }

        async fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
            self.outbound
                .send(packet.to_vec())
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
            Ok(packet.len())
        }
    }

    /// Two multiplexed transports wired together in memory
    pub(crate) fn mux_pair(streams: usize) -> (Arc<MuxTransport>, Arc<MuxTransport>) {
        let options = TransportOptions {
            streams,
            pool_capacity: 32,
            ..Default::default()
        };
        let make = |stream: tokio::io::DuplexStream| -> Arc<MuxTransport> {
            let (r, w) = tokio::io::split(stream);
            let r: BoxedReader = Box::new(r);
            let w: BoxedWriter = Box::new(w);
            Arc::new(MuxTransport::new(&options, r, w, Box::new(NullCloser)))
        };

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a, b) = (make(a), make(b));
        for i in 0..streams {
            let (x, y) = tokio::io::duplex(64 * 1024);
            let (xr, xw) = tokio::io::split(x);
            let (yr, yw) = tokio::io::split(y);
            a.attach_stream(i, Box::new(xr), Box::new(xw)).unwrap();
            b.attach_stream(i, Box::new(yr), Box::new(yw)).unwrap();
        }
        a.seal();
        b.seal();
        (a, b)
    }

    fn session(
        device: Arc<dyn NetworkInterface>,
        transport: Arc<dyn Transport>,
        stats: Arc<TrafficStats>,
    ) -> PipeSession {
        let routes = RouteSet::for_local_address("10.54.0.10/24", "").unwrap();
        PipeSession::new(device, transport, routes, stats, PumpOptions::default())
    }

    #[test]
    fn test_failure_flag_is_shared_and_sticky() {
        let flag = FailureFlag::new();
        let other = flag.clone();
        assert!(!other.is_set());
        flag.set();
        flag.set();
        assert!(other.is_set());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_packets_flow_both_ways() {
        let (left, right) = mux_pair(4);
        let (left_dev, mut left_io) = FakeInterface::new();
        let (right_dev, mut right_io) = FakeInterface::new();
        let left_stats = Arc::new(TrafficStats::new());
        let right_stats = Arc::new(TrafficStats::new());

        let left = Arc::new(session(left_dev, left, left_stats.clone()));
        let right = Arc::new(session(right_dev, right, right_stats.clone()));
        let cancel = CancellationToken::new();

        let runs = {
            let (left, right, cancel) = (left.clone(), right.clone(), cancel.clone());
            tokio::spawn(async move {
                let (l, r) = tokio::join!(left.run(&cancel), right.run(&cancel));
                (l, r)
            })
        };

        let packet: Vec<u8> = (0..1400).map(|i| (i % 251) as u8).collect();
        left_io.inject.send(Ok(packet.clone())).unwrap();
        let received = timeout(Duration::from_secs(5), right_io.written.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, packet);

        right_io.inject.send(Ok(b"reply".to_vec())).unwrap();
        let received = timeout(Duration::from_secs(5), left_io.written.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"reply");

        cancel.cancel();
        let (l, r) = timeout(Duration::from_secs(2), runs).await.unwrap().unwrap();
        assert!(l.is_ok());
        assert!(r.is_ok());
        assert_eq!(left_stats.uploaded(), 1400);
        assert_eq!(left_stats.downloaded(), 5);
        assert_eq!(right_stats.downloaded(), 1400);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_largest_packet_keeps_every_stream_alive() {
        let (left, right) = mux_pair(2);
        let (left_dev, left_io) = FakeInterface::new();
        let (right_dev, mut right_io) = FakeInterface::new();
        let left = Arc::new(session(left_dev, left, Arc::new(TrafficStats::new())));
        let right = Arc::new(session(right_dev, right, Arc::new(TrafficStats::new())));
        let cancel = CancellationToken::new();

        let runs = {
            let (left, right, cancel) = (left.clone(), right.clone(), cancel.clone());
            tokio::spawn(async move { tokio::join!(left.run(&cancel), right.run(&cancel)) })
        };

        let largest = PumpOptions::default().buffer_size;
        left_io.inject.send(Ok(vec![0xAB; largest])).unwrap();
        for i in 0..40u8 {
            left_io.inject.send(Ok(vec![i])).unwrap();
        }

        // Streams may reorder packets
        let mut sizes = Vec::new();
        for _ in 0..41 {
            let packet = timeout(Duration::from_secs(5), right_io.written.recv())
                .await
                .unwrap()
                .unwrap();
            sizes.push(packet.len());
        }
        assert_eq!(sizes.iter().filter(|len| **len == largest).count(), 1);
        assert_eq!(sizes.iter().filter(|len| **len == 1).count(), 40);
        assert!(!left.failure().is_set());
        assert!(!right.failure().is_set());

        cancel.cancel();
        let (l, r) = timeout(Duration::from_secs(2), runs).await.unwrap().unwrap();
        assert!(l.is_ok());
        assert!(r.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pump_failure_stops_other_pump_within_poll_interval() {
        let (left, _right) = mux_pair(2);
        let transport: Arc<dyn Transport> = left;
        let (device, io) = FakeInterface::new();
        let session = session(device, transport.clone(), Arc::new(TrafficStats::new()));
        let cancel = CancellationToken::new();

        let run = tokio::spawn({
            let session = Arc::new(session);
            let cancel = cancel.clone();
            async move {
                let result = session.run(&cancel).await;
                (result, session.failure().is_set())
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        let failed_at = tokio::time::Instant::now();
        io.inject
            .send(Err(io::Error::new(io::ErrorKind::Other, "device gone")))
            .unwrap();

        let (result, flagged) = run.await.unwrap();
        assert!(failed_at.elapsed() <= Duration::from_millis(250));
        assert!(flagged);
        match result {
            Err(SessionError::Pump(reason)) => assert!(reason.contains("device gone")),
            other => panic!("expected pump failure, got {:?}", other),
        }

        let mut buf = [0u8; 64];
        assert!(matches!(
            transport.read(&mut buf).await,
            Err(TransportError::StreamClosed)
        ));
        assert!(matches!(
            transport.write(b"late").await,
            Err(TransportError::StreamClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_loss_fails_session() {
        let (left, right) = mux_pair(2);
        let (device, _io) = FakeInterface::new();
        let session = session(device, left, Arc::new(TrafficStats::new()));
        let cancel = CancellationToken::new();

        right.close(CloseReason::Graceful).await;
        drop(right);

        let result = timeout(Duration::from_secs(5), session.run(&cancel))
            .await
            .expect("session did not notice peer loss");
        assert!(matches!(result, Err(SessionError::Pump(_))));
        assert!(session.failure().is_set());
    }

    #[tokio::test]
    async fn test_stats_line() {
        let (left, _right) = mux_pair(1);
        let (device, _io) = FakeInterface::new();
        let stats = Arc::new(TrafficStats::new());
        stats.add_uploaded(10);
        let session = session(device, left, stats);

        let line = session.stats_line();
        assert!(line.starts_with("Transport Stats: Borrowed: "));
        assert!(line.contains("Uploaded: 10 Downloaded: 0 Reconnects: 0"));
    }
}
