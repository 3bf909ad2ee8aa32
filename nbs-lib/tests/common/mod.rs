use std::path::PathBuf;

use nbs::{
    link::FrameSink,
    presentation::{
        gini::{FillerCache, Gini},
        send_gini,
    },
    transport::{ProductType, Sender},
};

pub fn fixture_path(name: &str) -> PathBuf {
    let mut path =
        PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR not set"));
    path.push("tests/fixtures");
    path.push(name);
    path
}

/// Load a serialized GINI fixture.
pub fn fixture_gini(name: &str) -> Gini {
    let dat = std::fs::read(fixture_path(name)).expect("fixture to be readable");
    let mut gini = Gini::new(FillerCache::new());
    gini.deserialize(&dat, ProductType::GoesEast)
        .expect("fixture to deserialize");
    gini
}

/// Frames of `gini` in the order sent.
pub fn gini_frames(gini: &Gini, run: u16) -> Vec<Vec<u8>> {
    let mut sender = Sender::new(Vec::<Vec<u8>>::new()).with_run(run);
    send_gini(gini, &mut sender).expect("gini to send");
    sender.into_inner()
}

/// Send every frame through `sink`.
pub fn send_frames<S: FrameSink>(frames: &[Vec<u8>], sink: &mut S) {
    for frame in frames {
        sink.send_frame(frame).expect("frame to send");
    }
}
