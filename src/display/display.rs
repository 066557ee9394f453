//! SDL2 Window Display Module
//! One window per stream, fed by a [`ChannelSink`](super::ChannelSink).
//! SDL must be driven from the thread that initialised it, so `run` blocks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use flume::{Receiver, RecvTimeoutError};
use sdl2::event::{Event, WindowEvent};
use sdl2::keyboard::Scancode;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::display::{AnnotatedFrame, SinkMessage};

const FRAME_WAIT: Duration = Duration::from_millis(16);

struct StreamWindow {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
}

/// SDL2 Window Display
pub struct Sdl2Display {
    video: sdl2::VideoSubsystem,
    windows: HashMap<Arc<str>, StreamWindow>,
    /// Streams whose window the user closed; they stay closed.
    dismissed: HashSet<Arc<str>>,
}

impl Sdl2Display {
    pub fn new(sdl_context: &sdl2::Sdl) -> Result<Self> {
        let video = sdl_context.video().map_err(|e| eyre!(e))?;
        Ok(Self {
            video,
            windows: HashMap::new(),
            dismissed: HashSet::new(),
        })
    }

    fn window_for(&mut self, stream: &Arc<str>, width: u32, height: u32) -> Result<&mut StreamWindow> {
        if !self.windows.contains_key(stream) {
            let window = self
                .video
                .window(&format!("Stream: {stream}"), width, height)
                .position_centered()
                .resizable()
                .build()?;
            let canvas = window.into_canvas().present_vsync().build()?;
            let texture_creator = canvas.texture_creator();
            info!(stream = %stream, width, height, "window opened");
            self.windows.insert(
                stream.clone(),
                StreamWindow {
                    canvas,
                    texture_creator,
                },
            );
        }
        self.windows
            .get_mut(stream)
            .ok_or_else(|| eyre!("window for {stream} vanished"))
    }

    pub fn render_frame(&mut self, frame: &AnnotatedFrame) -> Result<()> {
        if self.dismissed.contains(&frame.stream) {
            return Ok(());
        }
        let (width, height) = frame.image.dimensions();
        let window = self.window_for(&frame.stream, width, height)?;

        let mut texture = window
            .texture_creator
            .create_texture_streaming(PixelFormatEnum::RGB24, width, height)
            .map_err(|e| eyre!(e))?;
        texture
            .update(None, frame.image.as_raw(), (width * 3) as usize)
            .map_err(|e| eyre!(e))?;

        window.canvas.clear();
        window
            .canvas
            .copy(&texture, None, None)
            .map_err(|e| eyre!(e))?;
        window.canvas.present();
        Ok(())
    }

    /// Pump SDL events and draw frames until `token` is cancelled or the
    /// sink side goes away. `q`, Esc, quitting, or closing the last open
    /// window cancels `token`.
    pub fn run(
        &mut self,
        sdl_context: &sdl2::Sdl,
        rx: Receiver<SinkMessage>,
        token: &CancellationToken,
    ) -> Result<()> {
        let mut event_pump = sdl_context.event_pump().map_err(|e| eyre!(e))?;

        'running: while !token.is_cancelled() {
            for event in event_pump.poll_iter() {
                match event {
                    Event::Quit { .. }
                    | Event::KeyDown {
                        scancode: Some(Scancode::Q | Scancode::Escape),
                        ..
                    } => {
                        info!("Quit requested from display");
                        token.cancel();
                        break 'running;
                    }
                    Event::Window {
                        window_id,
                        win_event: WindowEvent::Close,
                        ..
                    } => {
                        let closed: Vec<Arc<str>> = self
                            .windows
                            .iter()
                            .filter(|(_, w)| w.canvas.window().id() == window_id)
                            .map(|(name, _)| name.clone())
                            .collect();
                        for name in closed {
                            debug!(stream = %name, "window closed by user");
                            self.windows.remove(&name);
                            self.dismissed.insert(name);
                        }
                        if self.windows.is_empty() {
                            info!("All windows closed");
                            token.cancel();
                            break 'running;
                        }
                    }
                    _ => {}
                }
            }

            match rx.recv_timeout(FRAME_WAIT) {
                Ok(SinkMessage::Frame(frame)) => {
                    if let Err(e) = self.render_frame(&frame) {
                        warn!(stream = %frame.stream, "render failed: {e}");
                    }
                }
                Ok(SinkMessage::Closed(stream)) => {
                    if self.windows.remove(&stream).is_some() {
                        debug!(stream = %stream, "window closed, stream ended");
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.windows.clear();
        Ok(())
    }
}
