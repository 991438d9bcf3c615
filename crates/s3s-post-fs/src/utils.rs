use crate::error::*;

use tokio::io::{AsyncWrite, AsyncWriteExt};

pub async fn write_counted<W>(writer: &mut W, bytes: &[u8]) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    Ok(bytes.len() as u64)
}
