use super::*;

fn write_sine_wav(path: &Path, sample_rate: u32, channels: u16, frames: usize) {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).expect("wav writer");
    for i in 0..frames {
        let t = i as f32 / sample_rate as f32;
        let sample = ((2.0 * std::f32::consts::PI * 440.0 * t).sin() * 8_000.0) as i16;
        for _ in 0..channels {
            writer.write_sample(sample).expect("write sample");
        }
    }
    writer.finalize().expect("finalize");
}

#[test]
fn splits_wav_into_fixed_duration_frames() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("tone.wav");
    write_sine_wav(&path, 48_000, 1, 4_800);

    let frames = WavSourceOpener::default()
        .open_source(&path)
        .expect("open")
        .collect::<Result<Vec<_>, _>>()
        .expect("decode");

    assert_eq!(frames.len(), 10);
    assert!(frames.iter().all(|frame| frame.samples.len() == 480));
    assert_eq!(frames[0].duration(), Duration::from_millis(10));
}

#[test]
fn pads_last_stereo_frame_with_silence() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("short.wav");
    write_sine_wav(&path, 8_000, 2, 100);

    let frames = WavSourceOpener::new(Duration::from_millis(20))
        .open_source(&path)
        .expect("open")
        .collect::<Result<Vec<_>, _>>()
        .expect("decode");

    // 20ms at 8kHz is 160 samples per channel, so 100 sample frames fit in one.
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].samples.len(), 320);
    assert_eq!(frames[0].channels, 2);
    assert!(frames[0].samples[200..].iter().all(|sample| *sample == 0));
}

#[test]
fn missing_file_is_source_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = WavSourceOpener::default()
        .open_source(&dir.path().join("absent.wav"))
        .err()
        .expect("must fail");
    assert!(matches!(err, AudioError::SourceNotFound(_)), "{err:?}");
}

#[test]
fn garbage_file_is_decode_failure() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("audio.mp3");
    std::fs::write(&path, b"ID3 definitely not a wav file").expect("write");

    let err = WavSourceOpener::default()
        .open_source(&path)
        .err()
        .expect("must fail");
    assert!(matches!(err, AudioError::DecodeFailed(_)), "{err:?}");
}

#[test]
fn converts_float_and_wide_int_samples() {
    assert_eq!(float_to_i16(1.5), i16::MAX);
    assert_eq!(float_to_i16(0.0), 0);
    assert_eq!(int_to_i16((1 << 23) - 1, 24), i16::MAX);
    assert_eq!(int_to_i16(-128, 8), -32_768);
}
