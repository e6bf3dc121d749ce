mod common;

use std::sync::Arc;

use common::*;
use ivalink::prelude::*;

fn link_with(params: EncLinkParams, registry: &CodecRegistry) -> (EncodeLink, Arc<Source<Frame>>) {
    let source = Arc::new(Source::default());
    let link = EncodeLink::create(params, registry.handle(), source.clone(), Arc::new(Sink::default()))
        .expect("create link");
    (link, source)
}

/// One default channel with `bufs` bitstream buffers.
fn single(bufs: usize) -> EncLinkParams {
    EncLinkParams {
        bufs_per_channel: bufs,
        ..EncLinkParams::with_channels(vec![enc_channel()])
    }
}

fn drain_units(link: &EncodeLink, want: usize) -> Vec<Bitstream> {
    let mut seen = Vec::new();
    wait_until("bitstream units", || {
        let units = link.get_full_buffers();
        seen.extend(units.iter().cloned());
        link.put_empty_buffers(units);
        seen.len() >= want
    });
    seen
}

#[test]
fn frames_are_encoded_in_order() {
    let (registry, _) = encode_registry(&[CodecType::H264High]);
    let (link, source) = link_with(single(8), &registry);
    source.push((0..6).map(|n| raw_frame(0, n)));
    link.notify_new_data();

    let units = drain_units(&link, 6);
    assert_eq!(units.iter().map(|u| u.timestamp).collect::<Vec<_>>(), (0..6).collect::<Vec<u64>>());
    assert!(units[0].is_key_frame);
    assert!(units[1..].iter().all(|u| !u.is_key_frame));
    assert!(units.iter().all(|u| u.fill_len == 16 && u.codec == CodecType::H264High));
    assert_eq!((units[0].width, units[0].height), (352, 288));
    wait_until("frames returned", || source.returned() == 6);
    link.delete().expect("delete");
}

#[test]
fn frame_rate_is_converted_at_the_input() {
    let (registry, _) = encode_registry(&[CodecType::H264High]);
    let mut channel = enc_channel();
    channel.dynamic.target_frame_rate = 15_000;
    let params = EncLinkParams {
        bufs_per_channel: 16,
        ..EncLinkParams::with_channels(vec![channel])
    };
    let (link, source) = link_with(params, &registry);
    source.push((0..30).map(|n| raw_frame(0, n)));
    link.notify_new_data();

    wait_until("frames returned", || source.returned() == 30);
    let stats = link.stats();
    assert_eq!((stats[0].input_dropped, stats[0].forwarded), (15, 15));
}

#[test]
fn force_dump_overrides_a_zero_frame_rate() {
    let (registry, _) = encode_registry(&[CodecType::H264High]);
    let (link, source) = link_with(EncLinkParams::with_channels(vec![enc_channel()]), &registry);
    link.set_fps(0, 0, None).expect("fps");
    link.force_dump_frame(0).expect("dump");
    source.push((0..3).map(|n| raw_frame(0, n)));
    link.notify_new_data();

    wait_until("frames returned", || source.returned() == 3);
    assert_eq!(link.stats()[0].input_dropped, 2);
    assert_eq!(drain_units(&link, 1)[0].timestamp, 0);
}

#[test]
fn input_is_dropped_without_a_bitstream_buffer() {
    let (registry, _) = encode_registry(&[CodecType::H264High]);
    let (link, source) = link_with(single(1), &registry);
    source.push((0..3).map(|n| raw_frame(0, n)));
    link.notify_new_data();

    wait_until("frames returned", || source.returned() == 3);
    assert_eq!(link.stats()[0].input_dropped, 2);
    let units = link.get_full_buffers();
    assert_eq!(units.len(), 1);
    let stats = link.buffer_stats(&[0]).expect("buffer stats");
    assert_eq!((stats[0].queued_inputs, stats[0].outstanding_outputs), (0, 1));
    link.put_empty_buffers(units);
}

#[test]
fn settings_are_validated_and_reach_the_next_picture() {
    let (registry, applied) = encode_registry(&[CodecType::H264High]);
    let (link, source) = link_with(EncLinkParams::with_channels(vec![enc_channel()]), &registry);

    assert!(matches!(link.set_bitrate(0, 1_000), Err(LinkError::Codec(_))));
    assert!(link.set_qp_p(0, QpRange { min: 0, max: 60, init: 20 }).is_err());
    assert_eq!(link.set_bitrate(4, 2_000_000), Err(LinkError::InvalidChannel(4)));
    assert_ne!(link.dyn_params(0).expect("params").target_bitrate, 1_000);

    link.set_bitrate(0, 2_000_000).expect("bitrate");
    link.set_intra_interval(0, 60).expect("intra interval");
    link.force_idr(0).expect("idr");
    source.push([raw_frame(0, 0), raw_frame(0, 1)]);
    link.notify_new_data();
    let units = drain_units(&link, 2);

    assert!(units[0].is_key_frame);
    let last = applied.lock().last().cloned().expect("params pushed");
    assert_eq!((last.target_bitrate, last.intra_interval), (2_000_000, 60));
}

#[test]
fn roi_is_clipped_to_the_input() {
    let (registry, _) = encode_registry(&[CodecType::H264High]);
    let (link, _source) = link_with(EncLinkParams::with_channels(vec![enc_channel()]), &registry);
    let mut roi = RoiParams::default();
    roi.regions.push(RoiRegion {
        start_x: 300,
        start_y: 0,
        width: 200,
        height: 100,
        ..RoiRegion::default()
    });
    link.set_roi(0, roi).expect("roi");
    let region = link.dyn_params(0).expect("params").roi.regions[0];
    assert_eq!(region.start_x + region.width, 352);
}

#[test]
fn codec_switch_applies_after_queued_frames() {
    let (registry, _) = encode_registry(&[CodecType::H264High, CodecType::Mjpeg]);
    let (link, source) = link_with(single(8), &registry);
    source.push((0..3).map(|n| raw_frame(0, n)));
    link.notify_new_data();

    let mut dynamic = EncDynamicParams::default();
    dynamic.qp_i.init = 80;
    link.switch_codec(
        0,
        CodecSwitchParams {
            codec: CodecType::Mjpeg,
            field_pic_encode: false,
            max_bitrate: 4_000_000,
            dynamic,
        },
    )
    .expect("switch");
    assert_eq!(link.codec(0), Some(CodecType::Mjpeg));
    assert_eq!(link.dyn_params(0).expect("params").qp_i.init, 80);

    source.push((3..5).map(|n| raw_frame(0, n)));
    link.notify_new_data();
    let units = drain_units(&link, 5);
    let codecs: Vec<CodecType> = units.iter().map(|u| u.codec).collect();
    assert_eq!(&codecs[..3], &[CodecType::H264High; 3]);
    assert_eq!(&codecs[3..], &[CodecType::Mjpeg; 2]);
    assert!(units[3..].iter().all(|u| u.is_key_frame));
}

#[test]
fn failed_switch_reports_allocation_failure() {
    let (registry, _) = encode_registry(&[CodecType::H264High]);
    let (link, _source) = link_with(EncLinkParams::with_channels(vec![enc_channel()]), &registry);
    let result = link.switch_codec(
        0,
        CodecSwitchParams {
            codec: CodecType::Mjpeg,
            field_pic_encode: false,
            max_bitrate: 4_000_000,
            dynamic: EncDynamicParams::default(),
        },
    );
    assert_eq!(result, Err(LinkError::ResourceAllocationFailed(0)));
    assert_eq!(link.codec(0), None);
}

#[test]
fn unregistered_codec_fails_link_create() {
    let (registry, _) = encode_registry(&[CodecType::H264High]);
    let channels = vec![
        enc_channel(),
        EncChannelConfig {
            codec: CodecType::Mjpeg,
            ..enc_channel()
        },
    ];
    let err = EncodeLink::create(
        EncLinkParams::with_channels(channels),
        registry.handle(),
        Arc::new(Source::default()),
        Arc::new(Sink::default()),
    )
    .err();
    assert!(matches!(err, Some(LinkError::Registry(_))));

    let oversize = EncChannelConfig {
        input: Resolution::new(8192, 8192),
        ..enc_channel()
    };
    let err = EncodeLink::create(
        EncLinkParams::with_channels(vec![oversize]),
        registry.handle(),
        Arc::new(Source::default()),
        Arc::new(Sink::default()),
    )
    .err();
    assert!(matches!(err, Some(LinkError::InvalidArg(_))));
}
