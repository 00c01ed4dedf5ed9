use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};

use crate::config::{EncoderSettings, FfmpegMode};
use crate::error::{PipelineError, PipelineResult};
use crate::frames::{FrameId, FrameStore};
use crate::timeline::{AudioTrackEntry, Timeline};

/// Writes an assembled timeline and its audio track to one video file.
/// Either the whole file lands at `output` or nothing does.
pub trait VideoEncoder: Send + Sync {
    fn encode(&self, timeline: &Timeline, frames: &FrameStore, output: &Path) -> PipelineResult<()>;
}

/// H.264/AAC MP4 through an `ffmpeg` child process fed raw RGBA on stdin.
#[derive(Debug, Clone, Default)]
pub struct FfmpegEncoder {
    settings: EncoderSettings,
}

impl FfmpegEncoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self { settings }
    }
}

impl VideoEncoder for FfmpegEncoder {
    fn encode(&self, timeline: &Timeline, frames: &FrameStore, output: &Path) -> PipelineResult<()> {
        let schedule = frame_schedule(timeline);
        if schedule.is_empty() {
            return Err(PipelineError::NoContent(
                "timeline has no frames to encode".to_owned(),
            ));
        }
        if let Some(missing) = schedule.iter().find(|id| frames.image(**id).is_none()) {
            return Err(PipelineError::Consistency(format!(
                "timeline references frame {} which was never rendered",
                missing.0
            )));
        }

        let staging = staging_path(output);
        let args = ffmpeg_args(
            frames.width(),
            frames.height(),
            timeline,
            &self.settings,
            &staging,
        );
        tracing::debug!(
            frames = schedule.len(),
            audio_inputs = timeline.audio.len(),
            output = %output.display(),
            "starting ffmpeg"
        );

        let written = write_video(&args, self.settings.mode, frames, &schedule);
        match written.and_then(|()| {
            fs::rename(&staging, output).with_context(|| {
                format!("failed to move {} into place", staging.display())
            })
        }) {
            Ok(()) => Ok(()),
            Err(error) => {
                let _ = fs::remove_file(&staging);
                Err(PipelineError::encoding_chain(&error))
            }
        }
    }
}

fn write_video(
    args: &[String],
    mode: FfmpegMode,
    frames: &FrameStore,
    schedule: &[FrameId],
) -> Result<()> {
    let pipe = FfmpegPipe::spawn(args.to_vec(), mode)?;
    let mut sent = 0;
    for id in schedule {
        let image = frames
            .image(*id)
            .ok_or_else(|| anyhow!("frame {} disappeared during encoding", id.0))?;
        // A refused frame means ffmpeg exited; its status explains why.
        if pipe.write_frame(image.as_raw().clone()).is_err() {
            break;
        }
        sent += 1;
    }
    pipe.finish()?;
    if sent != schedule.len() {
        bail!("ffmpeg accepted {sent} of {} frames", schedule.len());
    }
    Ok(())
}

/// Expands timeline entries into one frame id per output frame. Entry
/// boundaries are rounded on the running total, so sub-frame entries never
/// shift later ones.
pub fn frame_schedule(timeline: &Timeline) -> Vec<FrameId> {
    let fps = f64::from(timeline.fps);
    let mut schedule = Vec::with_capacity(timeline.entries.len());
    let mut elapsed = 0.0_f64;
    for entry in &timeline.entries {
        elapsed += entry.duration;
        let target = (elapsed * fps).round().max(0.0) as usize;
        while schedule.len() < target {
            schedule.push(entry.frame.id);
        }
    }
    schedule
}

fn staging_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_stem()
        .map(|stem| stem.to_os_string())
        .unwrap_or_default();
    name.push(".partial.mp4");
    output.with_file_name(name)
}

pub fn ffmpeg_args(
    width: u32,
    height: u32,
    timeline: &Timeline,
    settings: &EncoderSettings,
    output_path: &Path,
) -> Vec<String> {
    let fps = timeline.fps.to_string();
    let mut args = ffmpeg_rawvideo_input_args(&format!("{width}x{height}"), &fps);

    if timeline.audio.is_empty() {
        args.extend(
            [
                "-f",
                "lavfi",
                "-i",
                "anullsrc=channel_layout=stereo:sample_rate=44100",
            ]
            .map(str::to_owned),
        );
    } else {
        for entry in &timeline.audio {
            args.push("-i".to_owned());
            args.push(entry.clip.source.to_string_lossy().into_owned());
        }
    }

    args.push("-filter_complex".to_owned());
    args.push(filter_graph(&timeline.audio));
    args.extend(["-map", "[v]", "-map", "[aout]"].map(str::to_owned));
    args.extend(ffmpeg_h264_output_args(settings, &fps));
    args.push("-shortest".to_owned());
    args.extend(["-movflags", "+faststart"].map(str::to_owned));
    args.push(output_path.to_string_lossy().into_owned());
    args
}

pub fn ffmpeg_rawvideo_input_args(size: &str, fps: &str) -> Vec<String> {
    vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-f".to_owned(),
        "rawvideo".to_owned(),
        "-pix_fmt".to_owned(),
        "rgba".to_owned(),
        "-s:v".to_owned(),
        size.to_owned(),
        "-r".to_owned(),
        fps.to_owned(),
        "-i".to_owned(),
        "-".to_owned(),
    ]
}

pub fn ffmpeg_h264_output_args(settings: &EncoderSettings, fps: &str) -> Vec<String> {
    vec![
        "-c:v".to_owned(),
        "libx264".to_owned(),
        "-preset".to_owned(),
        settings.preset.clone(),
        "-crf".to_owned(),
        settings.crf.to_string(),
        "-pix_fmt".to_owned(),
        "yuv420p".to_owned(),
        "-r".to_owned(),
        fps.to_owned(),
        "-c:a".to_owned(),
        settings.audio_codec.clone(),
    ]
}

/// Pads video to even dimensions for yuv420p and lays every clip at its
/// offset, trimmed and scaled, mixed without level normalization.
fn filter_graph(audio: &[AudioTrackEntry]) -> String {
    let mut chains = vec!["[0:v]pad=ceil(iw/2)*2:ceil(ih/2)*2[v]".to_owned()];
    if audio.is_empty() {
        chains.push("[1:a]anull[aout]".to_owned());
        return chains.join(";");
    }

    let mut labels = String::new();
    for (idx, entry) in audio.iter().enumerate() {
        let delay_ms = (entry.start_offset * 1000.0).round().max(0.0) as u64;
        chains.push(format!(
            "[{input}:a]atrim=0:{duration:.3},asetpts=PTS-STARTPTS,volume={gain:.3},adelay={delay_ms}|{delay_ms}[a{idx}]",
            input = idx + 1,
            duration = entry.clip.duration,
            gain = entry.gain,
        ));
        labels.push_str(&format!("[a{idx}]"));
    }
    chains.push(format!(
        "{labels}amix=inputs={}:duration=longest:dropout_transition=0:normalize=0,apad[aout]",
        audio.len()
    ));
    chains.join(";")
}

pub struct FfmpegPipe {
    sender: Option<mpsc::SyncSender<Vec<u8>>>,
    worker: Option<JoinHandle<Result<()>>>,
}

trait FfmpegBackend: Send {
    fn mode_label(&self) -> &'static str;
    fn executable(&self) -> Result<PathBuf>;
}

struct SystemFfmpeg;

#[cfg(feature = "sidecar_ffmpeg")]
struct SidecarFfmpeg;

impl FfmpegPipe {
    pub fn spawn(args: Vec<String>, mode: FfmpegMode) -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(4);
        let backend = select_backend(mode)?;
        let worker_name = format!("chatreel-ffmpeg-{}", backend.mode_label());

        let worker = thread::Builder::new()
            .name(worker_name)
            .spawn(move || {
                let executable = backend.executable()?;
                run_ffmpeg_process(&executable, receiver, &args, backend.mode_label())
            })
            .context("failed to spawn ffmpeg writer thread")?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn write_frame(&self, rgba_frame: Vec<u8>) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("encoder has already been finalized"))?;
        sender
            .send(rgba_frame)
            .map_err(|_| anyhow!("ffmpeg stopped accepting frames"))
    }

    pub fn finish(mut self) -> Result<()> {
        drop(self.sender.take());

        let handle = self
            .worker
            .take()
            .ok_or_else(|| anyhow!("ffmpeg worker thread missing"))?;
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow!("ffmpeg worker thread panicked")),
        }
    }
}

fn select_backend(mode: FfmpegMode) -> Result<Box<dyn FfmpegBackend>> {
    match mode {
        FfmpegMode::Auto | FfmpegMode::System => Ok(Box::new(SystemFfmpeg)),
        FfmpegMode::Sidecar => {
            #[cfg(feature = "sidecar_ffmpeg")]
            {
                Ok(Box::new(SidecarFfmpeg))
            }
            #[cfg(not(feature = "sidecar_ffmpeg"))]
            {
                Err(anyhow!(
                    "ffmpeg sidecar mode requested but chatreel was built without `sidecar_ffmpeg`. Rebuild with `--features sidecar_ffmpeg`."
                ))
            }
        }
    }
}

impl FfmpegBackend for SystemFfmpeg {
    fn mode_label(&self) -> &'static str {
        "system"
    }

    fn executable(&self) -> Result<PathBuf> {
        Ok(PathBuf::from("ffmpeg"))
    }
}

#[cfg(feature = "sidecar_ffmpeg")]
impl FfmpegBackend for SidecarFfmpeg {
    fn mode_label(&self) -> &'static str {
        "sidecar"
    }

    fn executable(&self) -> Result<PathBuf> {
        let path = ffmpeg_sidecar::paths::ffmpeg_path();
        if !path.exists() {
            ffmpeg_sidecar::download::auto_download()
                .context("failed to auto-download ffmpeg sidecar binary")?;
        }
        Ok(path)
    }
}

fn run_ffmpeg_process(
    ffmpeg_path: &Path,
    receiver: mpsc::Receiver<Vec<u8>>,
    args: &[String],
    mode_label: &str,
) -> Result<()> {
    if let Some(output) = args.last() {
        if output.len() > 1024 {
            bail!("output path is suspiciously long");
        }
        if output.chars().any(|c| c.is_control()) {
            bail!("output path contains invalid control characters");
        }
    }

    let mut child = Command::new(ffmpeg_path)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                anyhow!(
                    "ffmpeg executable not found (mode={mode_label}, resolved_path={}). Install ffmpeg or use sidecar mode with `--features sidecar_ffmpeg`.",
                    ffmpeg_path.display()
                )
            } else {
                anyhow!(
                    "failed to spawn ffmpeg process (mode={mode_label}, resolved_path={}): {error}",
                    ffmpeg_path.display()
                )
            }
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("failed to capture ffmpeg stdin"))?;
    let mut stderr_pipe = child.stderr.take();

    let mut write_error = None;
    while let Ok(frame) = receiver.recv() {
        if let Err(error) = stdin.write_all(&frame) {
            write_error = Some(error);
            break;
        }
    }
    if write_error.is_none() {
        if let Err(error) = stdin.flush() {
            write_error = Some(error);
        }
    }
    drop(stdin);
    drop(receiver);

    let status = child.wait().context("failed waiting for ffmpeg process")?;
    let stderr_tail = read_stderr_tail(&mut stderr_pipe)?;
    if !status.success() {
        return Err(anyhow!(
            "ffmpeg failed with status {status} (mode={mode_label}, args='{}', stderr_tail='{}')",
            args.join(" "),
            stderr_tail
        ));
    }
    if let Some(error) = write_error {
        return Err(error).context("failed to write frame to ffmpeg stdin");
    }

    Ok(())
}

fn read_stderr_tail(stderr: &mut Option<std::process::ChildStderr>) -> Result<String> {
    let Some(mut pipe) = stderr.take() else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)
        .context("failed reading ffmpeg stderr")?;
    let text = String::from_utf8_lossy(&buf).to_string();
    Ok(last_n_chars(&text, 500))
}

fn last_n_chars(s: &str, max_chars: usize) -> String {
    let chars = s.chars().collect::<Vec<_>>();
    let start = chars.len().saturating_sub(max_chars);
    chars[start..].iter().collect::<String>().trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::FrameAsset;
    use crate::timeline::{AudioClip, TimelineEntry, TurnSpan};

    fn asset(id: usize) -> FrameAsset {
        FrameAsset {
            id: FrameId(id),
            turn_index: 0,
            is_final_for_turn: false,
        }
    }

    fn timeline(entries: Vec<(usize, f64)>, audio: Vec<AudioTrackEntry>) -> Timeline {
        Timeline {
            fps: 24,
            entries: entries
                .into_iter()
                .map(|(id, duration)| TimelineEntry {
                    frame: asset(id),
                    duration,
                })
                .collect(),
            audio,
            turns: Vec::<TurnSpan>::new(),
            audio_length: 0.0,
        }
    }

    #[test]
    fn schedule_repeats_frames_by_duration() {
        let frame = 1.0 / 24.0;
        let schedule = frame_schedule(&timeline(vec![(0, frame), (1, frame), (2, frame * 3.0)], vec![]));
        assert_eq!(
            schedule,
            vec![FrameId(0), FrameId(1), FrameId(2), FrameId(2), FrameId(2)]
        );
    }

    #[test]
    fn schedule_rounds_on_the_running_total() {
        // Half-frame entries alternate between being dropped and shown.
        let half = 0.5 / 24.0;
        let schedule = frame_schedule(&timeline(
            vec![(0, half), (1, half), (2, half), (3, half)],
            vec![],
        ));
        assert_eq!(schedule.len(), 2);

        let slow = 1.0 / 12.0;
        let schedule = frame_schedule(&timeline(vec![(0, slow), (1, slow)], vec![]));
        assert_eq!(schedule, vec![FrameId(0), FrameId(0), FrameId(1), FrameId(1)]);
    }

    #[test]
    fn args_place_each_clip_at_its_offset() {
        let audio = vec![
            AudioTrackEntry {
                clip: AudioClip::voice("/w/audio/line_000.mp3", 1.2),
                start_offset: 0.208,
                gain: 1.0,
            },
            AudioTrackEntry {
                clip: AudioClip::tick("/assets/tick.mp4", 0.5),
                start_offset: 0.208,
                gain: 0.5,
            },
        ];
        let args = ffmpeg_args(
            375,
            667,
            &timeline(vec![(0, 1.0)], audio),
            &EncoderSettings::default(),
            Path::new("/out/chat_video_x.partial.mp4"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-s:v 375x667 -r 24 -i -"));
        assert!(joined.contains("-i /w/audio/line_000.mp3 -i /assets/tick.mp4"));
        assert!(joined.contains("pad=ceil(iw/2)*2:ceil(ih/2)*2"));
        assert!(joined.contains("[1:a]atrim=0:1.200,asetpts=PTS-STARTPTS,volume=1.000,adelay=208|208[a0]"));
        assert!(joined.contains("[2:a]atrim=0:0.500,asetpts=PTS-STARTPTS,volume=0.500,adelay=208|208[a1]"));
        assert!(joined.contains("[a0][a1]amix=inputs=2"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-pix_fmt yuv420p"));
        assert!(joined.contains("-c:a aac"));
        assert!(joined.contains("-shortest"));
        assert_eq!(args.last().unwrap(), "/out/chat_video_x.partial.mp4");
    }

    #[test]
    fn silent_timeline_gets_a_null_audio_source() {
        let args = ffmpeg_args(
            4,
            4,
            &timeline(vec![(0, 1.0)], vec![]),
            &EncoderSettings::default(),
            Path::new("out.mp4"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-f lavfi -i anullsrc"));
        assert!(joined.contains("[1:a]anull[aout]"));
    }

    #[test]
    fn staging_file_sits_next_to_the_output() {
        assert_eq!(
            staging_path(Path::new("/out/chat_video_1.mp4")),
            PathBuf::from("/out/chat_video_1.partial.mp4")
        );
    }

    #[test]
    fn unknown_frame_is_inconsistent() {
        let store = FrameStore::new(2, 2);
        let error = FfmpegEncoder::default()
            .encode(&timeline(vec![(5, 1.0)], vec![]), &store, Path::new("x.mp4"))
            .unwrap_err();
        assert!(matches!(error, PipelineError::Consistency(_)));
    }

    #[test]
    fn empty_timeline_is_no_content() {
        let store = FrameStore::new(2, 2);
        let error = FfmpegEncoder::default()
            .encode(&timeline(vec![], vec![]), &store, Path::new("x.mp4"))
            .unwrap_err();
        assert!(matches!(error, PipelineError::NoContent(_)));
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        assert_eq!(last_n_chars("abcdef", 3), "def");
        assert_eq!(last_n_chars(" ab ", 10), "ab");
    }
}
