use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const TRANSFER_BUFFER_SIZE: usize = 8 * 1024;

/// Copy bytes in both directions between two streams until either half
/// sees EOF or an error, then shut both endpoints down. Returns the
/// totals moved from `a` to `b` and from `b` to `a`; errors are
/// terminal but otherwise swallowed.
pub async fn pipe<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (mut a_reader, mut a_writer) = split(a);
    let (mut b_reader, mut b_writer) = split(b);
    let stop = CancellationToken::new();

    let forward = {
        let stop = stop.clone();
        async move {
            let mut transferred = 0u64;
            let mut buffer = [0u8; TRANSFER_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    result = a_reader.read(&mut buffer) => match result {
                        Ok(0) | Err(_) => break,
                        Ok(len) => {
                            if b_writer.write_all(&buffer[..len]).await.is_err() {
                                break;
                            }
                            transferred += len as u64;
                        }
                    },
                }
            }
            let _ = b_writer.shutdown().await;
            stop.cancel();
            transferred
        }
    };
    let backward = {
        let stop = stop.clone();
        async move {
            let mut transferred = 0u64;
            let mut buffer = [0u8; TRANSFER_BUFFER_SIZE];
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    result = b_reader.read(&mut buffer) => match result {
                        Ok(0) | Err(_) => break,
                        Ok(len) => {
                            if a_writer.write_all(&buffer[..len]).await.is_err() {
                                break;
                            }
                            transferred += len as u64;
                        }
                    },
                }
            }
            let _ = a_writer.shutdown().await;
            stop.cancel();
            transferred
        }
    };

    tokio::join!(forward, backward)
}
