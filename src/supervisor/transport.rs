use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};

const MAX_FRAME_LEN: usize = 1 << 20;

/// One JSON object per newline-terminated UTF-8 frame.
pub type JsonFrames = Framed<TcpStream, LinesCodec>;

pub async fn open(address: &str) -> Result<JsonFrames> {
    let stream = TcpStream::connect(address)
        .await
        .with_context(|| format!("failed to connect to {address}"))?;
    Ok(Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN)))
}
