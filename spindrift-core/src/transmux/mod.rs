//! On-the-fly container remuxing for browser playback.
//!
//! Formats browsers cannot play natively are repackaged by an ffmpeg
//! child process: the video elementary stream is copied unchanged, audio
//! is transcoded to AAC at a fixed bitrate, and the output is fragmented
//! MP4 so it can be consumed incrementally without a known total length.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::TransmuxConfig;

/// Content type of the fragmented output container.
pub const FRAGMENTED_OUTPUT_CONTENT_TYPE: &str = "video/mp4";

/// Errors from the transmux pipeline.
///
/// Consumers must treat output-stream failure as terminal, not as
/// end-of-stream.
#[derive(Debug, thiserror::Error)]
pub enum TransmuxError {
    #[error("Failed to spawn ffmpeg at {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ffmpeg exited with {status}: {stderr_tail}")]
    ProcessFailed { status: String, stderr_tail: String },

    #[error("I/O error on ffmpeg pipe: {0}")]
    Pipe(#[from] std::io::Error),
}

/// Checks whether a filename carries a video extension.
pub fn is_video_file(name: &str) -> bool {
    matches!(
        extension_of(name).as_deref(),
        Some("mp4" | "mkv" | "avi" | "mov" | "wmv" | "flv" | "webm" | "m4v" | "ts" | "mpg" | "mpeg")
    )
}

/// Checks whether a file needs remuxing before browsers can play it.
///
/// Natively playable containers are served as-is with accurate lengths
/// and range support; everything else goes through the pipeline.
pub fn needs_transmux(path: &Path) -> bool {
    let name = path.to_string_lossy();
    !matches!(extension_of(&name).as_deref(), Some("mp4" | "m4v" | "webm"))
}

/// Determines the MIME type from a file extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let name = path.to_string_lossy();
    match extension_of(&name).as_deref() {
        Some("mp4") => "video/mp4",
        Some("m4v") => "video/x-m4v",
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("mov") => "video/quicktime",
        Some("wmv") => "video/x-ms-wmv",
        Some("flv") => "video/x-flv",
        Some("ts") => "video/mp2t",
        Some("mpg" | "mpeg") => "video/mpeg",
        _ => "application/octet-stream",
    }
}

fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

/// Drives ffmpeg child processes that remux byte streams for playback.
pub struct TransmuxPipeline {
    config: TransmuxConfig,
}

impl TransmuxPipeline {
    pub fn new(config: TransmuxConfig) -> Self {
        Self { config }
    }

    /// Argument list for the remux child process.
    ///
    /// Video is stream-copied, audio is converted once to AAC, and the
    /// output is fragmented so no seekable index is required up front.
    pub fn ffmpeg_args(&self) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            "pipe:0".to_string(),
            "-c:v".to_string(),
            "copy".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            format!("{}k", self.config.audio_bitrate_kbps),
            "-movflags".to_string(),
            "frag_keyframe+empty_moov+default_base_moof".to_string(),
            "-f".to_string(),
            "mp4".to_string(),
            "pipe:1".to_string(),
        ]
    }

    /// Wraps an input byte stream in a remuxing filter.
    ///
    /// The returned stream yields fragmented MP4 bytes as ffmpeg produces
    /// them. Dropping it kills the child process and releases the input,
    /// which is how client disconnects propagate backwards; that path is
    /// expected and only logged at debug level.
    ///
    /// # Errors
    /// - `TransmuxError::Spawn` - ffmpeg binary missing or not executable
    pub fn spawn<S, E>(
        &self,
        input: S,
    ) -> Result<impl Stream<Item = Result<Bytes, TransmuxError>> + Send + use<S, E>, TransmuxError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
        E: fmt::Display + Send + 'static,
    {
        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(self.ffmpeg_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransmuxError::Spawn {
                path: self.config.ffmpeg_path.clone(),
                source,
            })?;

        let stdin = child.stdin.take().expect("ffmpeg stdin was piped");
        let stdout = child.stdout.take().expect("ffmpeg stdout was piped");
        let stderr = child.stderr.take().expect("ffmpeg stderr was piped");

        // Feed the input stream into ffmpeg. A write failure means the
        // child went away (failure or consumer disconnect); the exit
        // status check on the output side decides which.
        tokio::spawn(feed_stdin(input, stdin));

        // Collect a bounded stderr tail for diagnostics on failure.
        let stderr_task = tokio::spawn(collect_stderr_tail(stderr));

        let state = OutputState {
            stdout,
            child,
            stderr_task,
            chunk_size: self.config.output_chunk_size,
        };

        Ok(futures::stream::try_unfold(state, read_output_chunk).boxed())
    }
}

struct OutputState {
    stdout: ChildStdout,
    child: Child,
    stderr_task: JoinHandle<String>,
    chunk_size: usize,
}

async fn read_output_chunk(
    mut state: OutputState,
) -> Result<Option<(Bytes, OutputState)>, TransmuxError> {
    let mut buf = vec![0u8; state.chunk_size];
    let n = state.stdout.read(&mut buf).await?;

    if n > 0 {
        buf.truncate(n);
        return Ok(Some((Bytes::from(buf), state)));
    }

    // EOF on stdout: the child has finished or died. Distinguish clean
    // completion from remux failure via the exit status.
    let status = state.child.wait().await?;
    if status.success() {
        return Ok(None);
    }

    let stderr_tail = (&mut state.stderr_task).await.unwrap_or_default();
    error!("Remux process failed ({status}): {stderr_tail}");
    Err(TransmuxError::ProcessFailed {
        status: status.to_string(),
        stderr_tail,
    })
}

async fn feed_stdin<S, E>(mut input: S, mut stdin: tokio::process::ChildStdin)
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin,
    E: fmt::Display,
{
    while let Some(item) = input.next().await {
        match item {
            Ok(bytes) => {
                if let Err(e) = stdin.write_all(&bytes).await {
                    // Child exited or consumer disconnected; not an error here
                    debug!("ffmpeg stdin closed: {e}");
                    return;
                }
            }
            Err(e) => {
                debug!("Input stream ended during remux: {e}");
                return;
            }
        }
    }

    if let Err(e) = stdin.shutdown().await {
        debug!("ffmpeg stdin shutdown: {e}");
    }
}

async fn collect_stderr_tail(stderr: tokio::process::ChildStderr) -> String {
    const TAIL_LIMIT: usize = 2048;

    let mut reader = tokio::io::BufReader::new(stderr);
    let mut output = String::new();
    let _ = tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut output).await;

    if output.len() > TAIL_LIMIT {
        let cut = output.len() - TAIL_LIMIT;
        output.split_off(cut)
    } else {
        output
    }
    .trim()
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransmuxConfig;

    #[test]
    fn test_needs_transmux_classification() {
        assert!(!needs_transmux(Path::new("/media/movie.mp4")));
        assert!(!needs_transmux(Path::new("/media/movie.webm")));
        assert!(!needs_transmux(Path::new("/media/movie.M4V")));
        assert!(needs_transmux(Path::new("/media/movie.mkv")));
        assert!(needs_transmux(Path::new("/media/movie.avi")));
        assert!(needs_transmux(Path::new("/media/noextension")));
    }

    #[test]
    fn test_is_video_file() {
        assert!(is_video_file("Big.Buck.Bunny.2008.mkv"));
        assert!(is_video_file("sample.MP4"));
        assert!(!is_video_file("readme.txt"));
        assert!(!is_video_file("cover.jpg"));
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("a.mp4")), "video/mp4");
        assert_eq!(content_type_for(Path::new("a.mkv")), "video/x-matroska");
        assert_eq!(
            content_type_for(Path::new("a.bin")),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_ffmpeg_args_copy_video_and_fragment_output() {
        let pipeline = TransmuxPipeline::new(TransmuxConfig::default());
        let args = pipeline.ffmpeg_args();

        let copy_pos = args.iter().position(|a| a == "-c:v").unwrap();
        assert_eq!(args[copy_pos + 1], "copy");

        let audio_pos = args.iter().position(|a| a == "-c:a").unwrap();
        assert_eq!(args[audio_pos + 1], "aac");

        let movflags_pos = args.iter().position(|a| a == "-movflags").unwrap();
        assert!(args[movflags_pos + 1].contains("frag_keyframe"));
        assert!(args[movflags_pos + 1].contains("empty_moov"));

        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }
}
