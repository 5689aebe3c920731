pub mod bus;
pub mod camera;
pub mod config;
pub mod db;
pub mod detect;
pub mod engine;
pub mod events;
pub mod frame;
pub mod ocr;
pub mod output;
pub mod queue;
pub mod track;
pub mod util;

/// Global one-time initialization of the video stack.
pub fn init() {
    ffmpeg::init().expect("failed to init ffmpeg");
}
