//! Pipeline construction
//!
//! Pure functions from configuration to [`PipelineDescription`]. Nothing in
//! here touches the OS or GStreamer; the descriptions are realized by the
//! runtime. Element names follow a small convention the runtime relies on:
//! `src` is the input, `enc` the video encoder, `counter` the byte counter
//! in front of a file sink, `sink` the terminal element, and `out` /
//! `audio_out` the leaf queues of mixer branches.

use std::path::Path;

use crate::config::{CameraConfig, Codec, MixerConfig, Resolution};
use crate::platform::EncoderProfile;

use super::description::{ElementSpec, PipelineDescription, PipelineKind, PropertyValue};

/// RTP depayloader for a codec published over RTSP
fn depayloader(codec: Codec) -> &'static str {
    match codec {
        Codec::H264 => "rtph264depay",
        Codec::H265 => "rtph265depay",
    }
}

fn parser(codec: Codec) -> &'static str {
    match codec {
        Codec::H264 => "h264parse",
        Codec::H265 => "h265parse",
    }
}

/// Effective ingest output resolution: the configured size when the source
/// is larger, otherwise the source size. The source always wins upward —
/// we never upscale.
pub fn effective_resolution(configured: Resolution, source: Resolution) -> Resolution {
    if source.pixels() > configured.pixels() {
        configured
    } else {
        source
    }
}

/// Capture → encode → publish for one camera.
///
/// `source_res` is the resolution the device currently reports, which may
/// differ from the configured one. A hardware scaler is inserted whenever
/// the effective output is smaller than the source. When `with_audio` is
/// set an ALSA branch feeds the same publisher; the ingest supervisor
/// retries without it if audio refuses to come up.
pub fn ingest(
    camera: &CameraConfig,
    profile: &EncoderProfile,
    source_res: Resolution,
    publish_url: &str,
    with_audio: bool,
) -> PipelineDescription {
    let out_res = effective_resolution(camera.resolution, source_res);
    let mut desc = PipelineDescription::new(format!("ingest_{}", camera.id), PipelineKind::Ingest);

    desc.add(
        ElementSpec::new("v4l2src", "src").prop("device", PropertyValue::Str(camera.device.clone())),
    )
    .add(ElementSpec::new("videoconvert", "convert"))
    .add(ElementSpec::new("videorate", "rate"))
    .add(encoder_spec(profile))
    .add(parser_spec(profile.parser))
    .add(ElementSpec::new("queue", "vqueue"))
    .add(
        ElementSpec::new("rtspclientsink", "sink")
            .prop("location", PropertyValue::Str(publish_url.to_string()))
            .prop("protocols", PropertyValue::from_str_value("tcp")),
    );

    desc.link_caps(
        "src",
        "convert",
        format!(
            "video/x-raw,width={},height={}",
            source_res.width, source_res.height
        ),
    );

    let enc_caps = format!(
        "video/x-raw,width={},height={},framerate={}/1",
        out_res.width, out_res.height, camera.framerate
    );
    if out_res != source_res {
        desc.add(ElementSpec::new("videoscale", "scale"));
        desc.link("convert", "scale").link("scale", "rate");
    } else {
        desc.link("convert", "rate");
    }
    desc.link_caps("rate", "enc", enc_caps);
    desc.chain(&["enc", "parse", "vqueue", "sink"]);

    if with_audio && camera.audio_enabled {
        let audio_src = match &camera.audio_device {
            Some(dev) => ElementSpec::new("alsasrc", "audio_src")
                .prop("device", PropertyValue::Str(dev.clone())),
            None => ElementSpec::new("alsasrc", "audio_src"),
        };
        desc.add(audio_src)
            .add(ElementSpec::new("audioconvert", "audio_convert"))
            .add(ElementSpec::new("audioresample", "audio_resample"))
            .add(ElementSpec::new("opusenc", "audio_enc"))
            .add(ElementSpec::new("queue", "aqueue"))
            .chain(&[
                "audio_src",
                "audio_convert",
                "audio_resample",
                "audio_enc",
                "aqueue",
                "sink",
            ]);
    }

    desc
}

/// Stream-path subscriber → fragmented file on disk.
///
/// Recording never re-encodes: key frames already arrive at one-second
/// cadence from the ingest encoder, so fragments close on key frame
/// boundaries and the file stays readable while it grows.
pub fn recording(
    path_name: &str,
    codec: Codec,
    read_url: &str,
    file: &Path,
    segment_seconds: u32,
) -> PipelineDescription {
    let mut desc =
        PipelineDescription::new(format!("recording_{}", path_name), PipelineKind::Recording);

    desc.add(
        ElementSpec::new("rtspsrc", "src")
            .prop("location", PropertyValue::Str(read_url.to_string()))
            .prop("latency", PropertyValue::UInt(200))
            .prop("protocols", PropertyValue::from_str_value("tcp")),
    )
    .add(ElementSpec::new(depayloader(codec), "depay"))
    .add(parser_spec(parser(codec)))
    .add(mux_spec(codec, segment_seconds))
    .add(ElementSpec::new("identity", "counter"))
    .add(
        ElementSpec::new("filesink", "sink")
            .prop("location", PropertyValue::Str(file.display().to_string()))
            .prop("sync", PropertyValue::Bool(false)),
    );

    // src → depay is linked at runtime when the RTP pad appears
    desc.link("src", "depay");
    desc.chain(&["depay", "parse", "mux", "counter", "sink"]);
    desc
}

/// Stream-path subscriber → single JPEG frames on an appsink
pub fn preview(path_name: &str, codec: Codec, decoder: &str, read_url: &str) -> PipelineDescription {
    let mut desc = PipelineDescription::new(format!("preview_{}", path_name), PipelineKind::Preview);

    desc.add(
        ElementSpec::new("rtspsrc", "src")
            .prop("location", PropertyValue::Str(read_url.to_string()))
            .prop("latency", PropertyValue::UInt(100))
            .prop("protocols", PropertyValue::from_str_value("tcp")),
    )
    .add(ElementSpec::new(depayloader(codec), "depay"))
    .add(parser_spec(parser(codec)))
    .add(ElementSpec::new(decoder, "dec"))
    .add(ElementSpec::new("videoconvert", "convert"))
    .add(ElementSpec::new("videoscale", "scale"))
    .add(
        ElementSpec::new("jpegenc", "jpegenc").prop("quality", PropertyValue::Int(80)),
    )
    .add(
        ElementSpec::new("appsink", "sink")
            .prop("max-buffers", PropertyValue::UInt(1))
            .prop("drop", PropertyValue::Bool(true))
            .prop("sync", PropertyValue::Bool(false)),
    );

    desc.link("src", "depay");
    desc.chain(&["depay", "parse", "dec", "convert", "scale"]);
    desc.link_caps("scale", "jpegenc", "video/x-raw,width=640,height=360");
    desc.link("jpegenc", "sink");
    desc
}

/// Stream-path subscriber → decoded, scaled frames on a leaf queue.
///
/// The mixer engine links the `out` queue (and `audio_out` when present) to
/// the compositor / audio mixer request pads. `crop` is pixels of the
/// scaled slot as `[left, top, right, bottom]`.
pub fn mixer_branch(
    key: &str,
    codec: Codec,
    decoder: &str,
    read_url: &str,
    target: Resolution,
    crop: Option<[u32; 4]>,
    with_audio: bool,
) -> PipelineDescription {
    let mut desc =
        PipelineDescription::new(format!("branch_{}", key), PipelineKind::MixerBranch);

    desc.add(
        ElementSpec::new("rtspsrc", "src")
            .prop("location", PropertyValue::Str(read_url.to_string()))
            .prop("latency", PropertyValue::UInt(100))
            .prop("protocols", PropertyValue::from_str_value("tcp")),
    )
    .add(ElementSpec::new(depayloader(codec), "depay"))
    .add(parser_spec(parser(codec)))
    .add(ElementSpec::new(decoder, "dec"))
    .add(ElementSpec::new("videoconvert", "convert"))
    .add(ElementSpec::new("videoscale", "scale"))
    .add(ElementSpec::new("queue", "out"));

    desc.link("src", "depay");
    desc.chain(&["depay", "parse", "dec", "convert", "scale"]);

    let scale_caps = format!("video/x-raw,width={},height={}", target.width, target.height);
    match crop {
        Some([left, top, right, bottom]) => {
            desc.add(
                ElementSpec::new("videocrop", "crop")
                    .prop("left", PropertyValue::UInt(left as u64))
                    .prop("top", PropertyValue::UInt(top as u64))
                    .prop("right", PropertyValue::UInt(right as u64))
                    .prop("bottom", PropertyValue::UInt(bottom as u64)),
            );
            desc.link_caps("scale", "crop", scale_caps);
            desc.link("crop", "out");
        }
        None => {
            desc.link_caps("scale", "out", scale_caps);
        }
    }

    if with_audio {
        desc.add(ElementSpec::new("rtpopusdepay", "audio_depay"))
            .add(ElementSpec::new("opusdec", "audio_dec"))
            .add(ElementSpec::new("audioconvert", "audio_convert"))
            .add(ElementSpec::new("audioresample", "audio_resample"))
            .add(ElementSpec::new("queue", "audio_out"));
        desc.link("src", "audio_depay");
        desc.chain(&[
            "audio_depay",
            "audio_dec",
            "audio_convert",
            "audio_resample",
            "audio_out",
        ]);
    }

    desc
}

/// Black frames for a slot whose source is not publishing yet.
///
/// Shares the branch leaf convention so the engine can swap it for a real
/// branch without touching the compositor pad.
pub fn placeholder_branch(key: &str, target: Resolution, framerate: u32) -> PipelineDescription {
    let mut desc = PipelineDescription::new(
        format!("placeholder_{}", key),
        PipelineKind::MixerBranch,
    );
    desc.add(
        ElementSpec::new("videotestsrc", "src")
            .prop("pattern", PropertyValue::from_str_value("black"))
            .prop("is-live", PropertyValue::Bool(true)),
    )
    .add(ElementSpec::new("queue", "out"));
    desc.link_caps(
        "src",
        "out",
        format!(
            "video/x-raw,width={},height={},framerate={}/1",
            target.width, target.height, framerate
        ),
    );
    desc
}

/// Composition, graphics layer, program encoder and publisher.
///
/// Source branches are attached to `comp` and `amix` dynamically by the
/// engine; the description itself carries the static skeleton, including a
/// silence generator so the audio path never stalls when no source carries
/// audio, and an RGBA appsrc for the graphics overlay layer.
pub fn mixer_program(
    cfg: &MixerConfig,
    profile: &EncoderProfile,
    publish_url: &str,
) -> PipelineDescription {
    let res = cfg.output_resolution;
    let mut desc = PipelineDescription::new("mixer_program", PipelineKind::MixerProgram);

    desc.add(
        ElementSpec::new("compositor", "comp")
            .prop("background", PropertyValue::from_str_value("black")),
    )
    .add(ElementSpec::new("videoconvert", "convert"))
    .add(encoder_spec(profile))
    .add(parser_spec(profile.parser))
    .add(ElementSpec::new("queue", "vqueue"))
    .add(
        ElementSpec::new("rtspclientsink", "sink")
            .prop("location", PropertyValue::Str(publish_url.to_string()))
            .prop("protocols", PropertyValue::from_str_value("tcp")),
    );

    desc.link_caps(
        "comp",
        "convert",
        format!(
            "video/x-raw,width={},height={},framerate={}/1",
            res.width, res.height, cfg.output_framerate
        ),
    );
    desc.chain(&["convert", "enc", "parse", "vqueue", "sink"]);

    // Graphics overlay layer: RGBA frames pushed by the renderer; the
    // engine sets the typed caps on the appsrc before starting
    desc.add(
        ElementSpec::new("appsrc", "gfx_src")
            .prop("is-live", PropertyValue::Bool(true))
            .prop("do-timestamp", PropertyValue::Bool(true))
            .prop("format", PropertyValue::from_str_value("time")),
    )
    .add(ElementSpec::new("videoconvert", "gfx_convert"))
    .add(ElementSpec::new("queue", "gfx_out"));
    desc.chain(&["gfx_src", "gfx_convert", "gfx_out"]);
    desc.link("gfx_out", "comp");

    // Audio: mixer plus a silence bed so downstream muxing never stalls
    desc.add(ElementSpec::new("audiomixer", "amix"))
        .add(ElementSpec::new("audioconvert", "audio_convert"))
        .add(ElementSpec::new("opusenc", "audio_enc"))
        .add(ElementSpec::new("queue", "aqueue"))
        .add(
            ElementSpec::new("audiotestsrc", "silence")
                .prop("wave", PropertyValue::from_str_value("silence"))
                .prop("is-live", PropertyValue::Bool(true)),
        );
    desc.link("silence", "amix");
    desc.chain(&["amix", "audio_convert", "audio_enc", "aqueue", "sink"]);

    desc
}

fn encoder_spec(profile: &EncoderProfile) -> ElementSpec {
    let mut spec = ElementSpec::new(profile.element.clone(), "enc");
    for (key, value) in &profile.properties {
        spec = spec.prop(key.clone(), value.clone());
    }
    spec
}

fn parser_spec(parser: &str) -> ElementSpec {
    // repeat parameter sets on every key frame so late subscribers sync
    ElementSpec::new(parser, "parse").prop("config-interval", PropertyValue::Int(-1))
}

fn mux_spec(codec: Codec, segment_seconds: u32) -> ElementSpec {
    match codec {
        Codec::H264 => ElementSpec::new("mp4mux", "mux")
            .prop(
                "fragment-duration",
                PropertyValue::UInt(segment_seconds as u64 * 1000),
            )
            .prop("streamable", PropertyValue::Bool(true)),
        // Matroska clusters are bounded by time; no global index is written
        // in streamable mode, so the file survives a crash mid-write.
        Codec::H265 => ElementSpec::new("matroskamux", "mux")
            .prop("streamable", PropertyValue::Bool(true)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{PlatformProbe, SocFamily};
    use std::path::PathBuf;

    fn test_profile() -> EncoderProfile {
        PlatformProbe::with_lookup(SocFamily::Unknown, |n| n == "x264enc")
            .resolve(Codec::H264, false, 4000, 30)
            .unwrap()
    }

    fn cam(resolution: Resolution, audio: bool) -> CameraConfig {
        CameraConfig {
            id: "cam0".into(),
            device: "/dev/video0".into(),
            enabled: true,
            resolution,
            framerate: 30,
            bitrate: 4000,
            codec: Codec::H264,
            audio_device: None,
            audio_enabled: audio,
        }
    }

    #[test]
    fn test_effective_resolution() {
        // source larger than configured: configured wins, scaler territory
        assert_eq!(
            effective_resolution(Resolution::HD1080, Resolution::UHD4K),
            Resolution::HD1080
        );
        // source smaller than configured: source wins, never upscale
        assert_eq!(
            effective_resolution(Resolution::UHD4K, Resolution::HD1080),
            Resolution::HD1080
        );
        assert_eq!(
            effective_resolution(Resolution::HD1080, Resolution::HD1080),
            Resolution::HD1080
        );
    }

    #[test]
    fn test_ingest_4k_source_gets_scaler() {
        let desc = ingest(
            &cam(Resolution::HD1080, false),
            &test_profile(),
            Resolution::UHD4K,
            "rtsp://127.0.0.1:8554/cam0",
            false,
        );
        desc.verify().unwrap();
        assert!(desc.element("scale").is_some());
        // encoder caps pin the configured output size
        let enc_link = desc.links.iter().find(|l| l.to == "enc").unwrap();
        assert!(enc_link.caps.as_deref().unwrap().contains("width=1920"));
    }

    #[test]
    fn test_ingest_matching_source_has_no_scaler() {
        let desc = ingest(
            &cam(Resolution::HD1080, false),
            &test_profile(),
            Resolution::HD1080,
            "rtsp://127.0.0.1:8554/cam0",
            false,
        );
        desc.verify().unwrap();
        assert!(desc.element("scale").is_none());
    }

    #[test]
    fn test_ingest_audio_branch_is_parallel() {
        let desc = ingest(
            &cam(Resolution::HD1080, true),
            &test_profile(),
            Resolution::HD1080,
            "rtsp://127.0.0.1:8554/cam0",
            true,
        );
        desc.verify().unwrap();
        assert!(desc.element("audio_src").is_some());
        // both branches terminate at the publisher
        assert!(desc.links.iter().any(|l| l.from == "vqueue" && l.to == "sink"));
        assert!(desc.links.iter().any(|l| l.from == "aqueue" && l.to == "sink"));
    }

    #[test]
    fn test_ingest_audio_suppressed_on_retry() {
        let desc = ingest(
            &cam(Resolution::HD1080, true),
            &test_profile(),
            Resolution::HD1080,
            "rtsp://127.0.0.1:8554/cam0",
            false,
        );
        assert!(desc.element("audio_src").is_none());
    }

    #[test]
    fn test_recording_h264_uses_fragmented_mp4() {
        let desc = recording(
            "cam0",
            Codec::H264,
            "rtsp://127.0.0.1:8554/cam0",
            &PathBuf::from("/data/recordings/cam0/recording_20250101_120000.mp4"),
            1,
        );
        desc.verify().unwrap();
        let mux = desc.element("mux").unwrap();
        assert_eq!(mux.factory, "mp4mux");
        assert!(mux
            .properties
            .iter()
            .any(|(k, v)| k == "fragment-duration" && *v == PropertyValue::UInt(1000)));
        // byte counter sits in front of the file sink for the stall watchdog
        assert!(desc.links.iter().any(|l| l.from == "counter" && l.to == "sink"));
    }

    #[test]
    fn test_recording_h265_uses_streamable_matroska() {
        let desc = recording(
            "cam1",
            Codec::H265,
            "rtsp://127.0.0.1:8554/cam1",
            &PathBuf::from("/data/recordings/cam1/recording_20250101_120000.mkv"),
            1,
        );
        let mux = desc.element("mux").unwrap();
        assert_eq!(mux.factory, "matroskamux");
        assert_eq!(desc.element("depay").unwrap().factory, "rtph265depay");
    }

    #[test]
    fn test_mixer_branch_scales_to_slot() {
        let desc = mixer_branch(
            "camera_cam0",
            Codec::H264,
            "avdec_h264",
            "rtsp://127.0.0.1:8554/cam0",
            Resolution::new(960, 540),
            None,
            false,
        );
        desc.verify().unwrap();
        let caps = desc
            .links
            .iter()
            .find(|l| l.from == "scale" && l.to == "out")
            .and_then(|l| l.caps.clone())
            .unwrap();
        assert!(caps.contains("width=960"));
        assert!(desc.element("audio_out").is_none());
        assert!(desc.element("crop").is_none());
    }

    #[test]
    fn test_mixer_branch_with_crop_and_audio() {
        let desc = mixer_branch(
            "camera_cam0",
            Codec::H264,
            "mppvideodec",
            "rtsp://127.0.0.1:8554/cam0",
            Resolution::new(960, 540),
            Some([10, 0, 10, 0]),
            true,
        );
        desc.verify().unwrap();
        assert_eq!(desc.element("crop").unwrap().factory, "videocrop");
        assert!(desc.links.iter().any(|l| l.from == "crop" && l.to == "out"));
        assert!(desc.element("audio_out").is_some());
    }

    #[test]
    fn test_placeholder_branch_shares_leaf_convention() {
        let desc = placeholder_branch("camera_ghost", Resolution::new(960, 540), 30);
        desc.verify().unwrap();
        assert!(desc.element("out").is_some());
        assert_eq!(desc.element("src").unwrap().factory, "videotestsrc");
    }

    #[test]
    fn test_mixer_program_has_silence_and_graphics() {
        let desc = mixer_program(
            &MixerConfig::default(),
            &test_profile(),
            "rtsp://127.0.0.1:8554/mixer_program",
        );
        desc.verify().unwrap();
        assert!(desc.element("silence").is_some());
        assert!(desc.element("gfx_src").is_some());
        assert!(desc.links.iter().any(|l| l.from == "gfx_out" && l.to == "comp"));
        assert!(desc.links.iter().any(|l| l.from == "silence" && l.to == "amix"));
    }
}
