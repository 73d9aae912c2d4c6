//! The subscription cursor: turns a `(topic, start_offset)` pair into a
//! stream of decoded messages, tailing the active segment's growth and
//! crossing over to the next segment when rotation seals the current one.
//!
//! Modeled as a state machine (`Skipping` -> `Tailing`, with a transition back
//! to opening a fresh follower on crossover) rather than a dedicated task per
//! subscription: the whole thing lives inside one `async_stream::try_stream!`
//! generator, driven by whoever polls the returned [`Stream`].

use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use log::{debug, trace};
use tokio_util::sync::CancellationToken;

use crate::{error::SubscribeError, follower::Follower, frame, segment::Segment, topic::Topic};

/// Stream messages from `topic`, starting at `start_offset`, which must fall
/// within `segment` (the caller — [`crate::Broker::subscribe`] — has already
/// resolved and validated it). Terminates the stream with an error on
/// cancellation, a decode error, or an I/O failure; never panics.
pub fn stream(
    topic: Topic,
    segment: Segment,
    start_offset: u64,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Bytes, SubscribeError>> {
    try_stream! {
        let mut segment = segment;
        let mut skip = start_offset - segment.offset_begin();
        debug!(
            "subscription on topic {:?} starting at offset {start_offset} (segment {:012}, skip {skip})",
            topic.name(),
            segment.offset_begin(),
        );

        let ping = topic.listen(cancel.clone()).await;
        let mut follower = Follower::open(
            segment.path(),
            0,
            ping,
            topic.watch_backend(),
            topic.poll_interval(),
            cancel.clone(),
        )
        .await?;

        while skip > 0 {
            read_frame(&mut follower).await?;
            skip -= 1;
        }

        loop {
            if topic.is_sealed(segment.offset_begin()) {
                // This segment will never grow again. Re-stat directly rather
                // than trust the background task's last tick, to rule out a
                // race between the writer's final flush and our observing it.
                follower.refresh().await?;
                if follower.available() == 0 {
                    match topic.segment_after(segment.offset_begin()).await {
                        Some(next) => {
                            trace!(
                                "topic {:?}: segment {:012} exhausted, crossing over to {:012}",
                                topic.name(),
                                segment.offset_begin(),
                                next.offset_begin(),
                            );
                            segment = next;
                            let ping = topic.listen(cancel.clone()).await;
                            follower = Follower::open(
                                segment.path(),
                                0,
                                ping,
                                topic.watch_backend(),
                                topic.poll_interval(),
                                cancel.clone(),
                            )
                            .await?;
                            continue;
                        }
                        None => {
                            // The topic publishes the new active offset only
                            // after the successor segment is already in its
                            // list, so this shouldn't happen; guard against
                            // it with a short sleep rather than a busy spin
                            // or an indefinite wait on a file that is done
                            // growing.
                            tokio::time::sleep(topic.poll_interval()).await;
                            continue;
                        }
                    }
                }
            }

            let message = read_frame(&mut follower).await?;
            yield message;
        }
    }
}

/// Read exactly one frame off `follower`: wait for the 4-byte length field,
/// decode it, wait for the rest of the frame, then decode and validate the
/// body. Mirrors [`frame::decode_one`] but against a follower that suspends
/// at EOF instead of reporting it.
async fn read_frame(follower: &mut Follower) -> Result<Bytes, SubscribeError> {
    follower.wait_bytes(4).await?;
    let mut len_buf = [0u8; 4];
    follower.read_exact(&mut len_buf)?;
    let length = frame::parse_length(len_buf)?;

    follower.wait_bytes(length as u64).await?;
    let mut rest = vec![0u8; length as usize];
    follower.read_exact(&mut rest)?;

    Ok(frame::parse_body(&rest)?)
}
