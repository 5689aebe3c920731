use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context, Result};
use ffmpeg::{
    codec, format::Pixel, media, software, software::scaling, util::frame::video::Video,
};
use ndarray::{s, Array3, ArrayView2};
use tracing::{info, instrument, warn};

use crate::{
    camera::{SharedCameraMetrics, StreamInfo},
    config::CameraConfig,
    frame::Frame,
    queue::PushError,
    util::{EventsPerSecond, Shutdown},
};

/// Per-camera decoder loop.
///
/// Opens the camera's Detect input, forwards every compressed packet to the
/// packet ring and the packet hub, decodes to BGR, paces frames against the
/// stream's presentation timestamps and publishes them into the camera's
/// input queue, blocking or dropping depending on the backpressure mode.
pub struct CameraCapture {
    name: String,
    config: CameraConfig,
    metrics: SharedCameraMetrics,
    stop: Shutdown,
}

impl CameraCapture {
    pub fn new(
        name: impl Into<String>,
        config: CameraConfig,
        metrics: SharedCameraMetrics,
        stop: Shutdown,
    ) -> CameraCapture {
        CameraCapture {
            name: name.into(),
            config,
            metrics,
            stop,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Thread body. An unrecoverable input error ends this camera only;
    /// resources are released on every exit path.
    #[instrument(skip_all, fields(camera = %self.name), err)]
    pub fn run(&self) -> Result<()> {
        let input_path = self
            .config
            .ffmpeg
            .detect_input()
            .ok_or_else(|| anyhow!("no input with the Detect role"))?
            .path
            .clone();

        let mut input = ffmpeg::format::input(&input_path)
            .with_context(|| format!("failed to open input {input_path}"))?;
        let stream = input
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| anyhow!("video stream not found"))?;
        let stream_index = stream.index();
        let time_base = stream.time_base();
        self.metrics.set_stream_info(StreamInfo {
            parameters: stream.parameters(),
            time_base,
        });

        let mut decoder = codec::Context::from_parameters(stream.parameters())?
            .decoder()
            .video()?;
        // The converter is created from the first decoded frame; some
        // streams only report their pixel format after decoding starts.
        let mut converter: Option<scaling::Context> = None;

        let frame_queue = self.metrics.frame_queue().clone();
        let mut decoded = Video::empty();
        let mut bgr = Video::empty();
        let mut frame_index = 0u64;
        let mut start_pts: Option<i64> = None;
        let mut start_wall = Instant::now();
        let mut capture_eps = EventsPerSecond::default();
        capture_eps.start();
        let mut skipped_eps = EventsPerSecond::default();
        skipped_eps.start();

        info!("capture started");
        'read: for (stream, packet) in input.packets() {
            if self.stop.is_requested() || !self.metrics.is_enabled() {
                break;
            }
            if stream.index() != stream_index {
                continue;
            }

            // Two packet sinks besides the decoder: the GOP rewind ring and
            // the live remuxer subscriptions.
            self.metrics.ring_buffer().push(&packet, time_base);
            self.metrics.packet_hub().publish(&packet, time_base);

            if let Err(e) = decoder.send_packet(&packet) {
                warn!(error = %e, "decoder rejected packet");
                continue;
            }

            while decoder.receive_frame(&mut decoded).is_ok() {
                if self.stop.is_requested() {
                    break 'read;
                }

                // Pace against the wall clock; never skip ahead of a fast
                // decoder.
                if let Some(pts) = decoded.timestamp().or(decoded.pts()) {
                    let start = match start_pts {
                        Some(start) => start,
                        None => {
                            start_pts = Some(pts);
                            start_wall = Instant::now();
                            pts
                        }
                    };
                    let offset = f64::from(time_base) * (pts - start) as f64;
                    if offset > 0.0 {
                        let target = start_wall + Duration::from_secs_f64(offset);
                        let now = Instant::now();
                        if target > now {
                            std::thread::sleep(target - now);
                        }
                    }
                }

                if converter.is_none() {
                    converter = Some(software::converter(
                        (decoded.width(), decoded.height()),
                        decoded.format(),
                        Pixel::BGR24,
                    )?);
                }
                let Some(converter) = converter.as_mut() else {
                    continue;
                };
                converter.run(&decoded, &mut bgr)?;

                let frame = Arc::new(Frame::new(&self.name, frame_index, video_to_bgr(&bgr)));
                if !self.metrics.is_pull_based() {
                    // Push-based: wait for the consumer.
                    if frame_queue.push(frame).is_err() {
                        break 'read;
                    }
                } else {
                    match frame_queue.try_push(frame) {
                        Ok(()) => {}
                        Err(PushError::Full(_)) => {
                            skipped_eps.update();
                            self.metrics.set_skipped_fps(skipped_eps.eps());
                            warn!(
                                frame_index,
                                fps = capture_eps.eps(),
                                "queues overloaded, skipping frame"
                            );
                        }
                        Err(PushError::Aborted(_)) => break 'read,
                    }
                }

                frame_index += 1;
                capture_eps.update();
                self.metrics.set_camera_fps(capture_eps.eps());
            }
        }

        // Flush the decoder, throwing the remainder away.
        let _ = decoder.send_eof();
        while decoder.receive_frame(&mut decoded).is_ok() {}

        info!(frames = frame_index, "capture stopped");
        Ok(())
    }
}

/// Copies a BGR24 video frame into an owned `(h, w, 3)` array, minding the
/// row stride.
fn video_to_bgr(frame: &Video) -> Array3<u8> {
    let (h, w) = (frame.height() as usize, frame.width() as usize);
    let stride = frame.stride(0);
    let data = frame.data(0);
    let mut out = Array3::zeros((h, w, 3));
    for y in 0..h {
        let row = &data[y * stride..y * stride + w * 3];
        if let Ok(view) = ArrayView2::from_shape((w, 3), row) {
            out.slice_mut(s![y, .., ..]).assign(&view);
        }
    }
    out
}
