// PeerLink node: log in, link up with one peer over TCP, chat, send files and place calls from a terminal.

mod config;
mod media;
mod signal;
mod transport;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use peerlink_core::{
    format_bytes, ArtifactHandle, CallHandle, CallStatus, Direction, MediaKind, Notice, OutgoingFile,
    RouteOutcome, Session, SessionConfig, TransferId,
};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::media::NodeMedia;
use crate::signal::{Control, Frame};
use crate::transport::{Link, TcpChannel};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "usage: peerlink-node [--name NAME] listen | connect HOST:PORT";
const HELP: &str = "\
  <text>              send a chat message
  /send <path>        send a file
  /save <n>           save received file n to the download directory
  /call audio|video   call the peer
  /answer  /reject    respond to an incoming call
  /hangup             end the current call
  /mute               toggle the microphone during a call
  /end                end the chat
  /quit               log out and exit";

/// Link queue slots file transfers leave free for chat and call signaling.
const CHAT_RESERVE: usize = 8;
const PUMP_BACKOFF: Duration = Duration::from_millis(5);

type NodeSession = Session<TcpChannel, NodeMedia>;

/// How many messages transfers may queue on the link right now.
fn pump_budget(session: &NodeSession) -> usize {
    session
        .channel()
        .map_or(0, |c| c.headroom().saturating_sub(CHAT_RESERVE))
}

#[derive(Debug, PartialEq)]
enum Mode {
    Listen,
    Connect(String),
}

#[derive(Debug, PartialEq)]
struct Args {
    name: Option<String>,
    mode: Mode,
}

/// `Ok(None)` when the invocation only asked for version or help.
fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Option<Args>> {
    let mut name = None;
    let mut mode = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("peerlink-node {VERSION}");
                return Ok(None);
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(None);
            }
            "--name" | "-n" => name = Some(args.next().context("--name needs a value")?),
            "listen" => mode = Some(Mode::Listen),
            "connect" => mode = Some(Mode::Connect(args.next().context("connect needs HOST:PORT")?)),
            other => anyhow::bail!("unexpected argument {other:?}\n{USAGE}"),
        }
    }
    let mode = mode.context(USAGE)?;
    Ok(Some(Args { name, mode }))
}

fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args(std::env::args().skip(1))? else {
        return Ok(());
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("peerlink_node=info,peerlink_core=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cfg = config::load();
    let name = args
        .name
        .or_else(|| cfg.name.clone())
        .context("no login name: pass --name or set PEERLINK_NAME")?;
    let session = Session::login(
        &name,
        NodeMedia::new(&cfg.media),
        SessionConfig {
            chunk_size: cfg.chunk_size,
        },
    )?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(session, cfg, args.mode))
}

async fn run(session: NodeSession, cfg: config::Config, mode: Mode) -> anyhow::Result<()> {
    let (stop_tx, mut stop) = watch::channel(false);
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "signal handling unavailable");
                std::future::pending::<()>().await;
            }
        }
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let listener = match mode {
        Mode::Listen => Some(transport::listen(cfg.port).await?),
        Mode::Connect(_) => None,
    };
    let mut node = Node {
        session,
        download_dir: cfg.download_dir,
        received: Vec::new(),
    };
    println!("logged in as {}", node.session.peer_id());

    loop {
        let local = node.session.peer_id().clone();
        let link = match (&mode, &listener) {
            (Mode::Connect(addr), _) => transport::connect(addr, &local).await?,
            (Mode::Listen, Some(listener)) => {
                println!("waiting for a peer on port {}", cfg.port);
                tokio::select! {
                    link = transport::accept(listener, &local) => link?,
                    _ = stop.changed() => break,
                }
            }
            (Mode::Listen, None) => anyhow::bail!("listener not bound"),
        };
        let end = node.run_link(link, &mut stdin, &mut stop).await?;
        if end == LinkEnd::Quit || matches!(mode, Mode::Connect(_)) {
            break;
        }
    }

    let identity = node.session.logout();
    info!(user = %identity.peer_id(), "bye");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum LinkEnd {
    Closed,
    Quit,
}

struct Node {
    session: NodeSession,
    download_dir: PathBuf,
    /// Completed inbound files of the current chat, numbered from 1 for `/save`.
    received: Vec<ArtifactHandle>,
}

impl Node {
    async fn run_link(
        &mut self,
        link: Link,
        stdin: &mut Lines<BufReader<Stdin>>,
        stop: &mut watch::Receiver<bool>,
    ) -> anyhow::Result<LinkEnd> {
        let Link {
            peer,
            channel,
            mut inbound,
        } = link;
        self.received.clear();
        self.session.start_chat(channel)?;
        self.flush();
        println!("chatting with {peer}. /help lists commands");

        let end = loop {
            let pending = self.session.has_pending_transfers();
            let budget = if pending { pump_budget(&self.session) } else { 0 };
            tokio::select! {
                body = inbound.recv() => match body {
                    Some(body) => self.on_frame(&body),
                    None => {
                        self.session.on_channel_closed();
                        self.session.hang_up();
                        break LinkEnd::Closed;
                    }
                },
                line = stdin.next_line() => match line? {
                    Some(line) => {
                        if let Some(end) = self.on_command(line.trim()).await {
                            break end;
                        }
                    }
                    None => break self.leave(LinkEnd::Quit),
                },
                _ = std::future::ready(()), if budget > 0 => {
                    self.session.pump_transfers_within(budget);
                }
                _ = tokio::time::sleep(PUMP_BACKOFF), if pending && budget == 0 => {}
                _ = stop.changed() => break self.leave(LinkEnd::Quit),
            }
            self.flush();
        };
        self.flush();
        Ok(end)
    }

    /// Hang up over the link while it still exists, then end the chat.
    fn leave(&mut self, end: LinkEnd) -> LinkEnd {
        self.session.hang_up();
        self.flush();
        self.session.end_chat();
        end
    }

    fn on_frame(&mut self, body: &[u8]) {
        match signal::demux(body) {
            Ok(Frame::Chat(env)) => {
                if let RouteOutcome::Chat(seq) = self.session.on_channel_message(env) {
                    self.print_entry(seq);
                }
            }
            Ok(Frame::Control(c)) => self.on_control(c),
            Err(e) => warn!(error = %e, len = body.len(), "undecodable frame, dropping"),
        }
    }

    fn on_control(&mut self, control: Control) {
        let Some(peer) = self.session.chatting_with().cloned() else {
            debug!(?control, "control frame before chat opened, ignoring");
            return;
        };
        match control {
            Control::Hello(name) => warn!(%name, "repeated hello, ignoring"),
            Control::CallOffer { call, kind } => {
                let call = CallHandle(call);
                self.session.media_mut().track_incoming(&call);
                if let Err(e) = self.session.on_remote_offer(peer, kind, call) {
                    info!(error = %e, "incoming call refused");
                }
            }
            Control::CallAnswer { call } => {
                let remote = self.session.media_mut().remote_stream();
                self.session.on_remote_stream(&CallHandle(call), remote);
            }
            Control::CallEnd { call } => {
                let call = CallHandle(call);
                self.session.media_mut().remote_ended(&call);
                self.session.on_call_closed(&call);
            }
        }
    }

    async fn on_command(&mut self, line: &str) -> Option<LinkEnd> {
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            if let Err(e) = self.session.send_chat(line) {
                println!("! {e}");
            }
            return None;
        };
        let (cmd, arg) = rest
            .split_once(' ')
            .map_or((rest, ""), |(c, a)| (c, a.trim()));
        let result = match cmd {
            "send" => self.send_path(arg),
            "save" => self.save(arg).await,
            "call" => self.call(arg),
            "answer" => self.answer(),
            "reject" => {
                self.session.reject();
                Ok(())
            }
            "hangup" => {
                self.session.hang_up();
                Ok(())
            }
            "mute" => self
                .session
                .toggle_mute()
                .map(|muted| println!("{}", if muted { "muted" } else { "unmuted" }))
                .map_err(Into::into),
            "end" => return Some(self.leave(LinkEnd::Closed)),
            "quit" => return Some(self.leave(LinkEnd::Quit)),
            "help" => {
                println!("{HELP}");
                Ok(())
            }
            _ => Err(anyhow::anyhow!("unknown command /{cmd}; /help lists commands")),
        };
        if let Err(e) = result {
            println!("! {e:#}");
        }
        None
    }

    fn send_path(&mut self, arg: &str) -> anyhow::Result<()> {
        anyhow::ensure!(!arg.is_empty(), "usage: /send <path>");
        let path = Path::new(arg);
        let file = std::fs::File::open(path).with_context(|| format!("opening {arg}"))?;
        let size = file.metadata()?.len();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("path has no file name")?
            .to_string();
        let mime = mime_guess::from_path(path).first_or_octet_stream().to_string();
        let id = self
            .session
            .send_file(OutgoingFile::new(name.clone(), size, mime, file))?;
        println!("sending {name} ({}) [{id}]", format_bytes(size));
        Ok(())
    }

    async fn save(&mut self, arg: &str) -> anyhow::Result<()> {
        let n: usize = arg.parse().context("usage: /save <n>")?;
        let handle = n
            .checked_sub(1)
            .and_then(|i| self.received.get(i))
            .with_context(|| format!("no received file {n}"))?;
        let artifact = self
            .session
            .artifact(handle)
            .cloned()
            .context("file no longer available")?;
        // Never let a peer-chosen name escape the download directory.
        let file_name = Path::new(&artifact.name)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("download-{n}")));
        let path = self.download_dir.join(file_name);
        tokio::fs::write(&path, artifact.bytes())
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        println!("saved {} ({})", path.display(), format_bytes(artifact.len()));
        Ok(())
    }

    fn call(&mut self, arg: &str) -> anyhow::Result<()> {
        let kind = match arg {
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            _ => anyhow::bail!("usage: /call audio|video"),
        };
        let peer = self
            .session
            .chatting_with()
            .cloned()
            .context("no peer to call")?;
        self.session.start_call(peer, kind)?;
        Ok(())
    }

    /// Answer, then treat the caller's already-flowing media as the remote stream.
    fn answer(&mut self) -> anyhow::Result<()> {
        self.session.answer()?;
        if let Some(call) = self.session.call().map(|c| c.call().clone()) {
            let remote = self.session.media_mut().remote_stream();
            self.session.on_remote_stream(&call, remote);
        }
        Ok(())
    }

    /// Push queued call signaling onto the link and print pending notices.
    fn flush(&mut self) {
        for control in self.session.media_mut().take_outbox() {
            match self.session.channel_mut() {
                Some(ch) => {
                    if let Err(e) = ch.send_control(&control) {
                        warn!(error = %e, ?control, "control frame not sent");
                    }
                }
                None => debug!(?control, "no link, dropping control frame"),
            }
        }
        for notice in self.session.take_notices() {
            self.show(notice);
        }
    }

    fn print_entry(&self, seq: u64) {
        let entry = self
            .session
            .chat_log()
            .and_then(|log| log.entries().iter().find(|e| e.seq == seq));
        if let Some(e) = entry {
            if let Some(text) = e.text() {
                println!("{} {}: {text}", e.at.format("%H:%M"), e.sender);
            }
        }
    }

    fn file_name(&self, id: &TransferId) -> String {
        self.session
            .chat_log()
            .and_then(|log| log.transfer(id))
            .map_or_else(|| id.to_string(), |v| v.file_name.clone())
    }

    fn show(&mut self, notice: Notice) {
        match notice {
            Notice::ChatOpened { peer } => info!(%peer, "chat open"),
            Notice::ChatClosed { peer } => println!("chat with {peer} closed"),
            Notice::TransferComplete {
                id,
                direction: Direction::Outbound,
                ..
            } => println!("sent {}", self.file_name(&id)),
            Notice::TransferComplete {
                artifact: Some(handle),
                ..
            } => {
                let size = self.session.artifact(&handle).map_or(0, |a| a.len());
                let name = self.file_name(&handle.transfer_id);
                self.received.push(handle);
                println!(
                    "received {name} ({}); /save {} to keep it",
                    format_bytes(size),
                    self.received.len()
                );
            }
            Notice::TransferComplete { id, .. } => debug!(transfer = %id, "completed"),
            Notice::TransferFailed { id, reason, .. } => {
                println!("! transfer of {} failed: {reason}", self.file_name(&id))
            }
            Notice::CallStatusChanged { peer, kind, status } => match status {
                CallStatus::Outgoing => println!("calling {peer} ({kind})..."),
                CallStatus::Incoming => println!("{peer} is calling ({kind}). /answer or /reject"),
                CallStatus::Active => println!("in {kind} call with {peer}"),
                CallStatus::Idle => {}
            },
            Notice::CallFailed { peer, error } => println!("! call with {peer} failed: {error}"),
            Notice::CallEnded { peer, reason } => println!("call with {peer} ended ({reason})"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use peerlink_core::PeerId;

    fn args(v: &[&str]) -> anyhow::Result<Option<Args>> {
        parse_args(v.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_listen_and_connect() {
        assert_eq!(
            args(&["--name", "john", "listen"]).unwrap(),
            Some(Args {
                name: Some("john".into()),
                mode: Mode::Listen
            })
        );
        assert_eq!(
            args(&["connect", "10.0.0.2:47800"]).unwrap(),
            Some(Args {
                name: None,
                mode: Mode::Connect("10.0.0.2:47800".into())
            })
        );
    }

    #[test]
    fn version_short_circuits() {
        assert_eq!(args(&["--version"]).unwrap(), None);
    }

    #[test]
    fn bad_invocations_fail() {
        assert!(args(&[]).is_err());
        assert!(args(&["connect"]).is_err());
        assert!(args(&["--name"]).is_err());
        assert!(args(&["listen", "extra"]).is_err());
    }

    fn linked_session(chunk_size: u64) -> (NodeSession, tokio::sync::mpsc::Receiver<Vec<u8>>) {
        let media = NodeMedia::new(&MediaConfig::default());
        let mut s = Session::login("john", media, SessionConfig { chunk_size }).unwrap();
        let (channel, rx) = TcpChannel::detached(PeerId::new("kate"));
        s.start_chat(channel).unwrap();
        s.take_notices();
        (s, rx)
    }

    #[test]
    fn many_transfers_share_the_link_with_chat() {
        let (mut s, mut rx) = linked_session(10);
        for i in 0..80u8 {
            s.send_file(OutgoingFile::from_bytes(format!("f{i}.bin"), "", vec![i; 100]))
                .unwrap();
        }
        let mut frames = 0;
        let mut chats = 0;
        while s.has_pending_transfers() {
            while rx.try_recv().is_ok() {
                frames += 1;
            }
            let budget = pump_budget(&s);
            assert!(budget > 0);
            s.pump_transfers_within(budget);
            s.send_chat("still here").unwrap();
            chats += 1;
        }
        while rx.try_recv().is_ok() {
            frames += 1;
        }
        let notices = s.take_notices();
        assert!(!notices
            .iter()
            .any(|n| matches!(n, Notice::TransferFailed { .. })));
        let done = notices
            .iter()
            .filter(|n| matches!(n, Notice::TransferComplete { .. }))
            .count();
        assert_eq!(done, 80);
        assert_eq!(frames, 80 + 80 * 10 + chats);
    }

    #[test]
    fn full_link_leaves_transfers_pending() {
        let (mut s, mut rx) = linked_session(10);
        s.send_file(OutgoingFile::from_bytes("big.bin", "", vec![1u8; 1000]))
            .unwrap();
        for _ in 0..100 {
            s.pump_transfers();
        }
        assert_eq!(pump_budget(&s), 0);
        assert!(s.has_pending_transfers());
        assert!(s.take_notices().is_empty());

        while rx.try_recv().is_ok() {}
        while s.has_pending_transfers() {
            s.pump_transfers();
            while rx.try_recv().is_ok() {}
        }
        assert!(matches!(
            s.take_notices().as_slice(),
            [Notice::TransferComplete { direction: Direction::Outbound, .. }]
        ));
    }
}
