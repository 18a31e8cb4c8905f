// Raw protocol shell
//
// Lines from stdin go to the server unchanged; every line the server sends
// back is printed as is. Subscription updates interleave with replies.

use crate::client::{Client, Reader};
use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

async fn print_responses(mut lines: Reader) -> Result<usize> {
    let mut stdout = tokio::io::stdout();
    let mut printed = 0;
    while let Some(line) = lines.next_line().await? {
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
        printed += 1;
    }
    Ok(printed)
}

pub async fn run(client: Client) -> Result<()> {
    let (lines, mut writer) = client.into_parts();
    let printer = tokio::spawn(print_responses(lines));

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = stdin.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!("sending: {}", line);
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    // Half-close so the server finishes outstanding replies, then hangs up
    writer.shutdown().await?;
    let printed = printer.await??;
    info!("server closed the connection after {} response(s)", printed);
    Ok(())
}
