//! The encode worker: applies pending settings and runs the encoder.

use std::mem;

use ivalink_codec::prelude::*;

use super::{EncBarrier, EncRequest, EncShared};
use crate::{request::RequestKind, stats::Counter};

pub(super) fn run(shared: &EncShared, process: &BoundedRx<EncRequest>, done: &BoundedTx<EncRequest>) {
    while let RecvOutcome::Data(mut req) = process.recv_wait() {
        if req.is_regular() {
            encode(shared, &mut req);
            finish(shared, done, req);
        } else {
            run_barrier(shared, req);
        }
    }
    tracing::debug!(link = "encode", "worker exiting");
}

pub(super) fn run_barrier(shared: &EncShared, mut req: EncRequest) {
    if let RequestKind::Barrier(EncBarrier::CodecSwitch { params, reply }) =
        mem::replace(&mut req.kind, RequestKind::Regular)
    {
        let result = shared.switch_codec(req.ch, &params);
        if let Err(err) = &result {
            tracing::error!(ch = req.ch, error = %err, "codec switch failed");
        }
        let _ = reply.send(result);
    }
    shared.requests.release(req);
}

fn finish(shared: &EncShared, done: &BoundedTx<EncRequest>, req: EncRequest) {
    if let Err((_, mut req)) = done.try_send(req) {
        tracing::error!(ch = req.ch, "done queue refused a request");
        for unit in req.outputs.drain(..) {
            shared.out.put_empty(unit);
        }
        shared.requests.release(req);
        return;
    }
    shared.mailbox.ring_processed();
}

fn encode(shared: &EncShared, req: &mut EncRequest) {
    let ch = req.ch;
    let (mask, pending) = {
        let mut channel = shared.channels[ch].lock();
        (channel.mask.take(), channel.pending.clone())
    };
    let result = {
        let mut codec = shared.codecs[ch].lock();
        match (codec.as_mut(), req.outputs.first()) {
            (Some(encoder), Some(output)) => {
                if let Some(first) = req.inputs.first()
                    && first.info.rt_param_update
                {
                    let input = Resolution::new(first.info.width, first.info.height);
                    if let Err(err) = encoder.set_input(input, first.info.pitch[0]) {
                        tracing::warn!(ch, error = %err, "input resolution update failed");
                    }
                }
                if let Err(err) = encoder.apply(mask, &pending) {
                    tracing::warn!(ch, ?mask, error = %err, "dynamic params rejected");
                }
                encoder
                    .encode(&req.inputs, &output.payload)
                    .map(|outcome| (outcome, encoder.codec(), encoder.dynamic().input))
            }
            _ => Err(CodecError::NotCreated),
        }
    };

    match result {
        Ok((outcome, codec, input)) => {
            let timestamp = req.inputs.first().map_or(0, |f| f.timestamp);
            for unit in req.outputs.iter_mut() {
                unit.ch = ch;
                unit.fill_len = outcome.bytes;
                unit.is_key_frame = outcome.key_frame;
                unit.codec = codec;
                unit.width = input.width;
                unit.height = input.height;
                unit.timestamp = timestamp;
            }
        }
        Err(err) => {
            tracing::warn!(ch, error = %err, "picture not encoded");
            for unit in req.outputs.drain(..) {
                shared.stats.inc(ch, Counter::OutputDropped);
                shared.out.put_empty(unit);
            }
        }
    }
}
