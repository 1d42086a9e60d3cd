// Copyright 2024 The sshooks Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Relaying a subprocess over a channel.
//!
//! The channel's data goes to the standard input of the process, its
//! standard output and standard error come back as channel data and
//! extended data. Once the process is gone, the channel gets an EOF and
//! the exit status.

use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, error, info, warn};
use sshooks_util::runtime;
use sshooks_util::time::deadline;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::channel::{ChannelEvent, ChannelSink, EXTENDED_DATA_STDERR};
use crate::Error;

/// Status reported when the exit status of the process is unknown.
pub const UNKNOWN_EXIT_STATUS: u32 = 255;

/// Bytes the client may send ahead of what the process has read.
pub const MAX_PENDING_INPUT: usize = 16 * 1024 * 1024;

const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Start `command` and relay it over the channel until it exits.
///
/// The pending request is acknowledged with `sink.reply(true)` once the
/// process started; on [`Error::Spawn`] and [`Error::MissingPipe`]
/// nothing was sent yet. `input` carries what the client sends on the
/// channel after the request; its end means the channel is gone, in
/// which case the process is killed. So is a process running longer
/// than `timeout`, or one leaving more than [`MAX_PENDING_INPUT`] bytes
/// of input unread.
///
/// Returns the exit status sent to the client.
pub async fn run(
    mut command: Command,
    sink: &dyn ChannelSink,
    input: UnboundedReceiver<ChannelEvent>,
    timeout: Option<Duration>,
) -> Result<u32, Error> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(Error::Spawn)?;
    debug!("started process {:?}", child.id());

    let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
    let (Some(stdin), Some(stdout), Some(stderr)) = pipes else {
        let missing = match pipes {
            (None, _, _) => "stdin",
            (_, None, _) => "stdout",
            _ => "stderr",
        };
        kill(&mut child).await;
        return Err(Error::MissingPipe(missing));
    };

    sink.reply(true).await?;

    let mut pump = runtime::spawn(pump_input(input, stdin));

    let relay = async {
        let (out, err) = tokio::join!(
            forward(stdout, sink, None),
            forward(stderr, sink, Some(EXTENDED_DATA_STDERR)),
        );
        if let Err(e) = out.and(err) {
            warn!("output relay stopped: {}", e);
        }
        child.wait().await
    };

    let waited = tokio::select! {
        waited = relay => waited,
        pumped = &mut pump => {
            let e = match pumped {
                Ok(Ok(())) => Error::ChannelClosed,
                Ok(Err(e)) => e,
                Err(e) => {
                    error!("stdin relay: {}", e);
                    Error::ChannelClosed
                }
            };
            info!("{}, killing process {:?}", e, child.id());
            kill(&mut child).await;
            return Err(e);
        }
        _ = deadline(timeout) => {
            let timeout = timeout.unwrap_or_default();
            warn!("process {:?} timed out after {:?}", child.id(), timeout);
            kill(&mut child).await;
            return Err(Error::CommandTimeout(timeout));
        }
    };

    sink.eof().await?;
    match waited {
        Ok(status) => {
            let code = exit_code(status);
            if code != 0 {
                info!("process exited with {}", status);
            }
            sink.exit_status(code).await?;
            Ok(code)
        }
        Err(e) => {
            error!("waiting for process: {}", e);
            sink.exit_status(UNKNOWN_EXIT_STATUS).await?;
            Err(Error::Wait(e))
        }
    }
}

/// Copies channel data to `stdin` and returns once the channel is gone.
///
/// The queue is drained even while the process is not reading, so the
/// end of the channel is noticed at once. EOF from the client only
/// closes `stdin`, after everything before it was written.
async fn pump_input(
    mut input: UnboundedReceiver<ChannelEvent>,
    stdin: ChildStdin,
) -> Result<(), Error> {
    let mut stdin = Some(stdin);
    let mut pending = VecDeque::new();
    let mut pending_len = 0;
    let mut eof = false;
    loop {
        let writable = stdin.is_some() && !pending.is_empty();
        tokio::select! {
            event = input.recv() => match event {
                Some(ChannelEvent::Data(data)) => {
                    if stdin.is_none() || eof {
                        debug!("dropping {} bytes after stdin was closed", data.len());
                        continue;
                    }
                    pending_len += data.len();
                    if pending_len > MAX_PENDING_INPUT {
                        return Err(Error::InputOverflow(MAX_PENDING_INPUT));
                    }
                    pending.push_back(data);
                }
                Some(ChannelEvent::Eof) => eof = true,
                Some(ChannelEvent::Request(request)) => {
                    debug!("ignoring {:?} request while running", request.kind);
                }
                None => return Ok(()),
            },
            written = write_front(&mut stdin, &mut pending), if writable => match written {
                Ok(n) => pending_len -= n,
                Err(e) => {
                    debug!("stdin: {}", e);
                    stdin = None;
                    pending.clear();
                    pending_len = 0;
                }
            },
        }
        if eof && pending.is_empty() {
            if let Some(mut pipe) = stdin.take() {
                let _ = pipe.shutdown().await;
            }
        }
    }
}

/// Write as much of the oldest pending chunk as the pipe takes.
async fn write_front(
    stdin: &mut Option<ChildStdin>,
    pending: &mut VecDeque<Bytes>,
) -> io::Result<usize> {
    let (Some(pipe), Some(front)) = (stdin.as_mut(), pending.front_mut()) else {
        return Ok(0);
    };
    let n = pipe.write(front).await?;
    if n == 0 {
        return Err(io::ErrorKind::WriteZero.into());
    }
    front.advance(n);
    if front.is_empty() {
        pending.pop_front();
    }
    Ok(n)
}

async fn forward<R>(mut reader: R, sink: &dyn ChannelSink, ext: Option<u32>) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        buf.reserve(READ_BUFFER_SIZE);
        if reader.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
        let chunk = buf.split().freeze();
        match ext {
            None => sink.data(chunk).await?,
            Some(code) => sink.extended_data(code, chunk).await?,
        }
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!("kill: {}", e);
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> u32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code as u32,
        (None, Some(signal)) => 128 + signal as u32,
        (None, None) => UNKNOWN_EXIT_STATUS,
    }
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> u32 {
    status.code().map_or(UNKNOWN_EXIT_STATUS, |code| code as u32)
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

    use super::*;
    use crate::channel::tests::{RecordingSink, Sent};

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    fn channel() -> (
        UnboundedSender<ChannelEvent>,
        UnboundedReceiver<ChannelEvent>,
    ) {
        unbounded_channel()
    }

    #[tokio::test]
    async fn relays_stdout_then_exit_status() {
        let sink = RecordingSink::default();
        let (_tx, rx) = channel();
        let status = run(sh("echo hello you"), &sink, rx, None).await.unwrap();
        assert_eq!(status, 0);
        assert_eq!(
            sink.sent(),
            vec![
                Sent::Reply(true),
                Sent::Data(b"hello you\n".to_vec()),
                Sent::Eof,
                Sent::ExitStatus(0),
            ]
        );
    }

    #[tokio::test]
    async fn relays_stderr_and_real_exit_code() {
        let sink = RecordingSink::default();
        let (_tx, rx) = channel();
        let status = run(sh("echo oops >&2; exit 3"), &sink, rx, None)
            .await
            .unwrap();
        assert_eq!(status, 3);
        assert_eq!(
            sink.sent(),
            vec![
                Sent::Reply(true),
                Sent::Extended(EXTENDED_DATA_STDERR, b"oops\n".to_vec()),
                Sent::Eof,
                Sent::ExitStatus(3),
            ]
        );
    }

    #[tokio::test]
    async fn channel_data_reaches_stdin() {
        let sink = RecordingSink::default();
        let (tx, rx) = channel();
        tx.send(ChannelEvent::Data(Bytes::from_static(b"abc")))
            .unwrap();
        tx.send(ChannelEvent::Data(Bytes::from_static(b"def\n")))
            .unwrap();
        tx.send(ChannelEvent::Eof).unwrap();
        let status = run(Command::new("cat"), &sink, rx, None).await.unwrap();
        assert_eq!(status, 0);
        assert_eq!(sink.stdout(), b"abcdef\n");
    }

    #[tokio::test]
    async fn large_interleaved_output_does_not_deadlock() {
        let sink = RecordingSink::default();
        let (_tx, rx) = channel();
        let script = "i=0; while [ $i -lt 2000 ]; do \
                      echo 0123456789abcdef0123456789abcdef0123456789abcdef; \
                      echo fedcba9876543210fedcba9876543210 >&2; \
                      i=$((i+1)); done";
        let status = tokio::time::timeout(
            Duration::from_secs(30),
            run(sh(script), &sink, rx, None),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(status, 0);
        assert_eq!(sink.stdout().len(), 2000 * 49);
        assert_eq!(sink.stderr().len(), 2000 * 33);
    }

    #[tokio::test]
    async fn kills_process_after_timeout() {
        let sink = RecordingSink::default();
        let (_tx, rx) = channel();
        let timeout = Duration::from_millis(200);
        match run(sh("sleep 30"), &sink, rx, Some(timeout)).await {
            Err(Error::CommandTimeout(t)) => assert_eq!(t, timeout),
            r => panic!("unexpected result {r:?}"),
        }
        assert_eq!(sink.sent(), vec![Sent::Reply(true)]);
    }

    #[tokio::test]
    async fn kills_process_when_channel_closes() {
        let sink = RecordingSink::default();
        let (tx, rx) = channel();
        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(tx);
        });
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run(sh("sleep 30"), &sink, rx, None),
        )
        .await
        .unwrap();
        closer.await.unwrap();
        assert!(matches!(result, Err(Error::ChannelClosed)));
        assert!(!sink.sent().contains(&Sent::Eof));
    }

    #[tokio::test]
    async fn notices_close_while_stdin_is_blocked() {
        let sink = RecordingSink::default();
        let (tx, rx) = channel();
        tx.send(ChannelEvent::Data(Bytes::from(vec![0u8; 1 << 20])))
            .unwrap();
        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(tx);
        });
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run(sh("sleep 30"), &sink, rx, None),
        )
        .await
        .unwrap();
        closer.await.unwrap();
        assert!(matches!(result, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn unread_input_is_capped() {
        let sink = RecordingSink::default();
        let (tx, rx) = channel();
        let chunk = Bytes::from(vec![0u8; 1 << 20]);
        for _ in 0..(MAX_PENDING_INPUT >> 20) + 4 {
            tx.send(ChannelEvent::Data(chunk.clone())).unwrap();
        }
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            run(sh("sleep 30"), &sink, rx, None),
        )
        .await
        .unwrap();
        match result {
            Err(Error::InputOverflow(limit)) => assert_eq!(limit, MAX_PENDING_INPUT),
            r => panic!("unexpected result {r:?}"),
        }
        assert_eq!(sink.sent(), vec![Sent::Reply(true)]);
        drop(tx);
    }

    #[tokio::test]
    async fn spawn_failure_sends_nothing() {
        let sink = RecordingSink::default();
        let (_tx, rx) = channel();
        let result = run(Command::new("/nonexistent/sshooks-test-binary"), &sink, rx, None).await;
        assert!(matches!(result, Err(Error::Spawn(_))));
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn signal_death_maps_above_128() {
        let sink = RecordingSink::default();
        let (_tx, rx) = channel();
        let status = run(sh("kill -9 $$"), &sink, rx, None).await.unwrap();
        assert_eq!(status, 128 + 9);
    }
}
