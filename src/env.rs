use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::action::{ControlVector, BTN_LEFT, BTN_RIGHT};
use crate::{ScreenConfig, NATIVE_CHANNELS, NATIVE_HEIGHT, NATIVE_WIDTH};

/// What the simulator hands back after one action.
pub struct StepResult {
    /// Preprocessed `[channels, height, width]` observation.
    pub screen: Tensor,
    pub reward: f32,
    pub done: bool,
    pub info: HashMap<String, f64>,
}

/// The game simulator boundary. Calls are synchronous request/response;
/// a stalled simulator stalls the run.
pub trait Environment {
    /// Resets to the start of the level and returns the first observation.
    fn reset(&mut self) -> Result<Tensor>;

    /// Applies a full pad state for one step.
    fn step(&mut self, controls: &ControlVector) -> Result<StepResult>;

    /// Local display only; optional.
    fn render(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<E: Environment + ?Sized> Environment for Box<E> {
    fn reset(&mut self) -> Result<Tensor> {
        (**self).reset()
    }

    fn step(&mut self, controls: &ControlVector) -> Result<StepResult> {
        (**self).step(controls)
    }

    fn render(&mut self) -> Result<()> {
        (**self).render()
    }
}

/// Converts a raw native RGB frame (row-major, interleaved channels) into
/// the model's `[channels, height, width]` tensor: integer-stride
/// nearest-neighbour subsampling, optional luma grayscale, values in 0..1.
pub fn preprocess_frame(raw: &[u8], screen: &ScreenConfig, device: &Device) -> Result<Tensor> {
    let expected = NATIVE_HEIGHT * NATIVE_WIDTH * NATIVE_CHANNELS;
    if raw.len() != expected {
        bail!(
            "raw frame has {} bytes, expected {} ({}x{}x{})",
            raw.len(),
            expected,
            NATIVE_HEIGHT,
            NATIVE_WIDTH,
            NATIVE_CHANNELS
        );
    }
    if NATIVE_WIDTH % screen.width != 0 || NATIVE_HEIGHT % screen.height != 0 {
        bail!(
            "screen resolution {}x{} does not evenly divide the native {}x{} frame",
            screen.width,
            screen.height,
            NATIVE_WIDTH,
            NATIVE_HEIGHT
        );
    }
    let x_stride = NATIVE_WIDTH / screen.width;
    let y_stride = NATIVE_HEIGHT / screen.height;
    let channels = screen.channels();
    let mut data = vec![0f32; channels * screen.height * screen.width];
    for y in 0..screen.height {
        for x in 0..screen.width {
            let src = ((y * y_stride) * NATIVE_WIDTH + x * x_stride) * NATIVE_CHANNELS;
            let r = raw[src] as f32 / 255.0;
            let g = raw[src + 1] as f32 / 255.0;
            let b = raw[src + 2] as f32 / 255.0;
            if screen.grayscale {
                data[y * screen.width + x] = 0.299 * r + 0.587 * g + 0.114 * b;
            } else {
                let plane = screen.height * screen.width;
                data[y * screen.width + x] = r;
                data[plane + y * screen.width + x] = g;
                data[2 * plane + y * screen.width + x] = b;
            }
        }
    }
    Ok(Tensor::from_vec(
        data,
        (channels, screen.height, screen.width),
        device,
    )?)
}

#[derive(Serialize)]
enum WireRequest<'a> {
    Reset,
    Step { controls: &'a [u8] },
    Render,
}

#[derive(Deserialize)]
struct WireReply {
    screen: Vec<u8>,
    reward: f32,
    done: bool,
    #[serde(default)]
    info: HashMap<String, f64>,
}

/// Client for the remote contest simulator: bincode request/reply frames
/// over a Unix domain socket, raw native frames back.
pub struct RemoteEnv {
    reader: BufReader<UnixStream>,
    writer: BufWriter<UnixStream>,
    screen: ScreenConfig,
    device: Device,
}

impl RemoteEnv {
    pub fn connect(socket: &Path, screen: ScreenConfig, device: Device) -> Result<Self> {
        screen.validate()?;
        let stream = UnixStream::connect(socket)
            .with_context(|| format!("connecting to simulator socket {}", socket.display()))?;
        let reader = BufReader::new(stream.try_clone().context("cloning simulator socket")?);
        let writer = BufWriter::new(stream);
        Ok(Self {
            reader,
            writer,
            screen,
            device,
        })
    }

    fn round_trip(&mut self, request: &WireRequest<'_>) -> Result<WireReply> {
        bincode::serialize_into(&mut self.writer, request)
            .context("sending simulator request")?;
        self.writer.flush().context("flushing simulator request")?;
        bincode::deserialize_from(&mut self.reader).context("reading simulator reply")
    }
}

impl Environment for RemoteEnv {
    fn reset(&mut self) -> Result<Tensor> {
        let reply = self.round_trip(&WireRequest::Reset)?;
        preprocess_frame(&reply.screen, &self.screen, &self.device)
    }

    fn step(&mut self, controls: &ControlVector) -> Result<StepResult> {
        let reply = self.round_trip(&WireRequest::Step { controls })?;
        Ok(StepResult {
            screen: preprocess_frame(&reply.screen, &self.screen, &self.device)?,
            reward: reply.reward,
            done: reply.done,
            info: reply.info,
        })
    }

    fn render(&mut self) -> Result<()> {
        self.round_trip(&WireRequest::Render)?;
        Ok(())
    }
}

/// Deterministic built-in side-scroller stub: a corridor of cells with the
/// goal at the right end. RIGHT advances one cell for +1, LEFT retreats for
/// -1, everything else stands still; reaching the goal ends the episode
/// with a bonus. Frames encode the agent's position as a bright column.
///
/// Used by the `sim` environment target and by tests, so the full loop
/// runs with no external simulator.
pub struct SimCorridorEnv {
    screen: ScreenConfig,
    device: Device,
    track_len: usize,
    x: usize,
}

impl SimCorridorEnv {
    pub const GOAL_BONUS: f32 = 10.0;

    pub fn new(screen: ScreenConfig, track_len: usize, device: Device) -> Self {
        assert!(track_len >= 2);
        Self {
            screen,
            device,
            track_len,
            x: 0,
        }
    }

    fn frame(&self) -> Result<Tensor> {
        let channels = self.screen.channels();
        let (h, w) = (self.screen.height, self.screen.width);
        let col = self.x * (w - 1) / (self.track_len - 1);
        let mut data = vec![0f32; channels * h * w];
        for c in 0..channels {
            for y in 0..h {
                data[c * h * w + y * w + col] = 1.0;
            }
        }
        Ok(Tensor::from_vec(data, (channels, h, w), &self.device)?)
    }
}

impl Environment for SimCorridorEnv {
    fn reset(&mut self) -> Result<Tensor> {
        self.x = 0;
        self.frame()
    }

    fn step(&mut self, controls: &ControlVector) -> Result<StepResult> {
        let mut reward = 0.0;
        if controls[BTN_RIGHT] == 1 {
            self.x += 1;
            reward = 1.0;
        } else if controls[BTN_LEFT] == 1 && self.x > 0 {
            self.x -= 1;
            reward = -1.0;
        }
        let done = self.x == self.track_len - 1;
        if done {
            reward += Self::GOAL_BONUS;
        }
        Ok(StepResult {
            screen: self.frame()?,
            reward,
            done,
            info: HashMap::from([("x".to_string(), self.x as f64)]),
        })
    }

    fn render(&mut self) -> Result<()> {
        debug!("corridor position {}/{}", self.x, self.track_len - 1);
        Ok(())
    }
}
