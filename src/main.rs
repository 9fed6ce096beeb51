use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use kixcache::config::load_config;
use kixcache::engine::{Engine, FastPath};
use kixcache::matcher::RuntimeConfig;
use kixcache::watcher;

const UDP_RECV_BUFFER: usize = 4096;

#[derive(Parser, Debug)]
#[command(author, version, about = "KixCache caching DNS forwarder with hot-reload blocklists", long_about = None)]
struct Args {
    /// 配置文件路径（JSON）
    #[arg(short = 'c', long = "config", default_value = "config/kixcache.json")]
    config: PathBuf,
    /// 启用调试日志
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker 数量（默认 CPU 核心数）
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let cfg = load_config(&args.config).context("load initial config")?;
    let cfg = RuntimeConfig::from_config(cfg).context("compile blocklist")?;
    let bind_addr: SocketAddr = cfg.settings.bind_udp.parse().context("parse bind addr")?;
    let bind_tcp: SocketAddr = cfg
        .settings
        .bind_tcp
        .parse()
        .context("parse tcp bind addr")?;

    let engine = Engine::new(cfg);
    engine.spawn_maintenance();
    watcher::spawn(args.config.clone(), engine.clone());

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    info!(
        bind_udp = %bind_addr,
        bind_tcp = %bind_tcp,
        udp_workers = udp_workers,
        cache = %engine.cache().map(|c| c.to_string()).unwrap_or_else(|| "disabled".to_string()),
        "dns server started"
    );

    let mut udp_handles = Vec::with_capacity(udp_workers);

    #[cfg(unix)]
    {
        // 每个 worker 独立 socket，由内核经 SO_REUSEPORT 分发
        for worker_id in 0..udp_workers {
            let engine = engine.clone();
            let std_socket = create_reuseport_udp_socket(bind_addr)
                .with_context(|| format!("create udp socket for worker {}", worker_id))?;
            let socket = UdpSocket::from_std(std_socket)?;
            let handle = tokio::spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, Arc::new(socket), engine).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
            udp_handles.push(handle);
        }
    }

    #[cfg(not(unix))]
    {
        use socket2::{Domain, Protocol, Socket, Type};
        let domain = if bind_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
        let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
        let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
        socket.set_nonblocking(true).context("set nonblocking")?;
        socket.bind(&bind_addr.into()).context("bind socket")?;

        let udp_socket = Arc::new(UdpSocket::from_std(socket.into()).context("from_std")?);
        for worker_id in 0..udp_workers {
            let engine = engine.clone();
            let socket = Arc::clone(&udp_socket);
            let handle = tokio::spawn(async move {
                if let Err(err) = run_udp_worker(worker_id, socket, engine).await {
                    error!(worker_id, error = %err, "udp worker exited");
                }
            });
            udp_handles.push(handle);
        }
    }

    let tcp_listener = TcpListener::bind(bind_tcp)
        .await
        .context("bind tcp listener")?;
    let tcp_engine = engine.clone();
    let tcp_handle = tokio::spawn(async move {
        if let Err(err) = run_tcp(tcp_listener, tcp_engine).await {
            error!(error = %err, "tcp server exited");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(metrics = %engine.metrics_snapshot(), "shutting down");
        }
        _ = tcp_handle => {}
    }
    for h in udp_handles {
        h.abort();
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    // 默认禁用 JSON，非 debug 仅 warn
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(false)
        .with_level(debug);

    let level = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[cfg(unix)]
fn create_reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use libc::{SO_REUSEPORT, SOL_SOCKET, c_int, c_void, setsockopt, socklen_t};
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let val: c_int = 1;
    let fd = socket.as_raw_fd();
    // SAFETY: fd is a live socket owned by `socket`; val outlives the call.
    let ret = unsafe {
        setsockopt(
            fd,
            SOL_SOCKET,
            SO_REUSEPORT,
            &val as *const _ as *const c_void,
            std::mem::size_of_val(&val) as socklen_t,
        )
    };
    if ret != 0 {
        debug!(addr = %addr, "SO_REUSEPORT unavailable, continuing without it");
    }
    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// 接收循环内同步应答拦截与缓存命中，仅上游转发才 spawn
async fn run_udp_worker(
    worker_id: usize,
    socket: Arc<UdpSocket>,
    engine: Engine,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; UDP_RECV_BUFFER];

    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                debug!(worker_id, error = %err, "udp recv failed");
                continue;
            }
        };
        let packet = &buf[..len];

        match engine.handle_packet_fast(packet, false) {
            Ok(FastPath::Answered(resp)) => {
                let _ = socket.send_to(&resp, peer).await;
            }
            Ok(FastPath::Forward(pending)) => {
                let packet = packet.to_vec();
                let engine = engine.clone();
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    if let Ok(resp) = engine.resolve(&packet, pending).await {
                        let _ = socket.send_to(&resp, peer).await;
                    }
                });
            }
            Err(err) => {
                debug!(worker_id, peer = %peer, error = %err, "dropping malformed packet");
            }
        }
    }
}

async fn run_tcp(listener: TcpListener, engine: Engine) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_tcp_conn(stream, engine).await {
                debug!(peer = %peer, error = %err, "tcp connection closed with error");
            }
        });
    }
}

async fn handle_tcp_conn(mut stream: TcpStream, engine: Engine) -> anyhow::Result<()> {
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        stream.read_exact(&mut buf).await?;

        let resp = match engine.handle_packet(&buf, true).await {
            Ok(r) => r,
            Err(_) => return Ok(()),
        };

        let Ok(resp_len) = u16::try_from(resp.len()) else {
            return Ok(());
        };
        stream.write_all(&resp_len.to_be_bytes()).await?;
        stream.write_all(&resp).await?;
    }
}
