//! Scripted in-memory engines for adapter tests.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::process::EngineIo;

/// Runs a fake engine that answers each received line with `respond(line)`.
/// The handle yields every line the adapter sent, ending at `quit` or EOF.
pub(crate) fn fake_engine<F>(respond: F) -> (EngineIo, JoinHandle<Vec<String>>)
where
    F: Fn(&str) -> Vec<String> + Send + 'static,
{
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let (reader, writer) = tokio::io::split(ours);
    let io = EngineIo::new(reader, writer, CancellationToken::new());

    let handle = tokio::spawn(async move {
        let (their_reader, mut their_writer) = tokio::io::split(theirs);
        let mut lines = BufReader::new(their_reader).lines();
        let mut log = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            for reply in respond(&line) {
                if their_writer.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
                    return log;
                }
            }
            let quit = line == "quit";
            log.push(line);
            if quit {
                break;
            }
        }
        log
    });
    (io, handle)
}
