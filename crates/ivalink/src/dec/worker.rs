//! The decode worker: runs requests against the channel's decoder.

use std::mem;

use ivalink_codec::{decoder::dedupe_ids, prelude::*};
use smallvec::SmallVec;

use super::{DecBarrier, DecRequest, DecShared};
use crate::request::RequestKind;

pub(super) fn run(shared: &DecShared, process: &BoundedRx<DecRequest>, done: &BoundedTx<DecRequest>) {
    while let RecvOutcome::Data(mut req) = process.recv_wait() {
        match mem::replace(&mut req.kind, RequestKind::Regular) {
            RequestKind::Regular => {
                decode(shared, &mut req);
                finish(shared, done, req);
            }
            RequestKind::Barrier(DecBarrier::FlushFrame) => {
                flush(shared, &mut req);
                req.kind = RequestKind::Barrier(DecBarrier::FlushFrame);
                finish(shared, done, req);
            }
            barrier @ RequestKind::Barrier(DecBarrier::ChannelDelete { .. }) => {
                req.kind = barrier;
                run_barrier(shared, req);
            }
        }
    }
    tracing::debug!(link = "decode", "worker exiting");
}

/// Run a barrier that does not travel back through the collect path.
pub(super) fn run_barrier(shared: &DecShared, mut req: DecRequest) {
    match mem::replace(&mut req.kind, RequestKind::Regular) {
        RequestKind::Barrier(DecBarrier::ChannelDelete { reply, result }) => {
            tracing::debug!(ch = req.ch, "delete barrier reached");
            shared.close_channel(req.ch);
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
        }
        RequestKind::Barrier(DecBarrier::FlushFrame) => flush(shared, &mut req),
        RequestKind::Regular => {}
    }
    shared.requests.release(req);
}

fn finish(shared: &DecShared, done: &BoundedTx<DecRequest>, req: DecRequest) {
    if let Err((_, req)) = done.try_send(req) {
        tracing::error!(ch = req.ch, "done queue refused a request");
        let tags: Vec<BufTag> = req.outputs.iter().map(|f| f.tag).collect();
        shared.release_frames(&tags);
        shared.requests.release(req);
        return;
    }
    shared.mailbox.ring_processed();
}

fn decode(shared: &DecShared, req: &mut DecRequest) {
    let ch = req.ch;
    let (bytes, timestamp) = req
        .inputs
        .first()
        .map_or((Vec::new(), 0), |unit| (unit.bytes(), unit.timestamp));

    let outcome = {
        let mut codec = shared.codecs[ch].lock();
        match codec.as_mut() {
            Some(decoder) => decoder.decode(&bytes, &req.outputs),
            None => {
                tracing::warn!(ch, "request for a channel without decoder");
                DecodeOutcome {
                    freed: req.outputs.iter().map(|f| f.tag).collect(),
                    ..DecodeOutcome::default()
                }
            }
        }
    };

    // A frame freed twice would give away a reference the next stage holds.
    let mut freed = outcome.freed;
    dedupe_ids(&mut freed);
    let mut shown: SmallVec<[Frame; 2]> = SmallVec::new();
    {
        let mut frames = shared.frames.lock();
        for out in outcome.outputs.into_iter().flatten() {
            let Some(frame) = frames.set_display(out.tag, &out.info, timestamp, out.meta) else {
                tracing::warn!(ch, tag = out.tag.0, "codec displayed an unknown frame");
                continue;
            };
            match freed.iter().position(|t| *t == out.tag) {
                // Released by the codec: the original itself goes out.
                Some(pos) => {
                    freed.remove(pos);
                    frames.hand_over(out.tag);
                    shown.push(frame);
                }
                // Still a reference: send a duplicate.
                None => shown.push(frames.duplicate(out.tag)),
            }
        }
    }
    shared.release_codec_frames(&freed);
    req.outputs = shown;
}

/// End of stream: release what the codec holds and the request's own outputs.
fn flush(shared: &DecShared, req: &mut DecRequest) {
    let mut tags: Vec<BufTag> = req.outputs.drain(..).map(|f| f.tag).collect();
    let decoder = shared.codecs.get(req.ch);
    if let Some(decoder) = decoder
        && let Some(decoder) = decoder.lock().as_mut()
    {
        tags.extend(decoder.flush_all());
        tracing::debug!(ch = req.ch, released = tags.len(), "decoder flushed");
    }
    shared.release_codec_frames(&tags);
}
