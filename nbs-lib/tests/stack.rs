mod common;

use std::{
    fs::File,
    io::{BufReader, Write},
    thread,
};

use common::{fixture_gini, fixture_path, gini_frames, send_frames};
use nbs::{
    application::{MemoryQueue, Product},
    link::{Link, StreamFrames, WriteFrames},
    presentation::{
        gini::{codec, FILL_BYTE},
        send_gini,
    },
    queue::FrameQueue,
    transport::{Frame, Sender, MAX_FRAME_LEN},
    Stack, StackOptions,
};
use test_case::test_case;

fn stack() -> (Stack, MemoryQueue) {
    let products = MemoryQueue::new();
    let stack = Stack::new(
        Box::new(products.clone()),
        StackOptions::builder().origin("test-host").build(),
    );
    (stack, products)
}

#[test_case("goes_east_ir.gini", 2; "uncompressed")]
#[test_case("goes_east_ir_z.gini", 5; "compressed")]
fn test_send_receive_through_queue(name: &str, num_blocks: usize) {
    let gini = fixture_gini(name);
    assert_eq!(gini.num_blocks(), num_blocks);
    assert_eq!(gini.actual_records(), 21);
    let orig = std::fs::read(fixture_path(name)).unwrap();

    let (mut writer, mut reader) = FrameQueue::new(4 * MAX_FRAME_LEN).unwrap().split();
    let sender = thread::spawn(move || {
        let mut sender = Sender::new(&mut writer).with_run(3);
        send_gini(&gini, &mut sender).unwrap();
        send_gini(&gini, &mut sender).unwrap();
        // dropping the writer shuts the queue down
    });

    let (mut stack, products) = stack();
    stack.receive_queue(&mut reader).unwrap();
    sender.join().unwrap();

    let products: Vec<Product> = products.products();
    assert_eq!(products.len(), 1, "second copy should be a duplicate");
    assert_eq!(products[0].data, orig);
    assert_eq!(products[0].origin, "test-host");
    assert!(products[0]
        .ident
        .ends_with("/GOES-16/IR/20160422 1915/EAST-CONUS/4km/ TIGE01 KNES 221915"));

    assert_eq!(stack.insert_counts().inserted, 1);
    assert_eq!(stack.insert_counts().duplicates, 1);
    assert_eq!(stack.transport_stats().products, 2);
    assert_eq!(stack.transport_stats().missing, 0);
    assert_eq!(stack.link_stats().total_frames, 2 * num_blocks);
}

#[test]
fn test_lost_frame_is_filled() {
    let gini = fixture_gini("goes_east_ir_z.gini");
    let mut frames = gini_frames(&gini, 1);
    // lose the second data block, records 8..16
    frames.remove(2);

    let (mut writer, mut reader) = FrameQueue::new(4 * MAX_FRAME_LEN).unwrap().split();
    let sender = thread::spawn(move || send_frames(&frames, &mut writer));

    let (mut stack, products) = stack();
    stack.receive_queue(&mut reader).unwrap();
    sender.join().unwrap();

    assert_eq!(stack.transport_stats().missing, 1);
    let products = products.products();
    assert_eq!(products.len(), 1);

    let mut received = nbs::presentation::gini::Gini::new(Default::default());
    received
        .deserialize(&products[0].data, nbs::transport::ProductType::GoesEast)
        .unwrap();
    assert_eq!(received.num_blocks(), 5);
    assert_eq!(received.actual_records(), 21);
    let gap: Vec<u8> = {
        let block = received.blocks().nth(2).unwrap();
        codec::unpack_vec(block, 1 << 16)
            .unwrap()
            .0
    };
    assert_eq!(gap, vec![FILL_BYTE; 8 * 64]);
}

#[test]
fn test_stream_file_with_garbage() {
    let gini = fixture_gini("goes_east_ir.gini");
    let frames = gini_frames(&gini, 1);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"leading garbage").unwrap();
    let mut sink = WriteFrames::new(file.as_file_mut());
    send_frames(&frames, &mut sink);
    sink.into_inner().unwrap();

    let (mut stack, products) = stack();
    let mut source = StreamFrames::new(BufReader::new(File::open(file.path()).unwrap()));
    stack.receive_source(&mut source).unwrap();

    assert_eq!(products.len(), 1);
    assert_eq!(
        products.products()[0].data,
        std::fs::read(fixture_path("goes_east_ir.gini")).unwrap()
    );
}

#[test]
fn test_fill_queue_from_source() {
    let gini = fixture_gini("goes_east_ir_z.gini");
    let stream = gini_frames(&gini, 1).concat();

    let (mut writer, mut reader) = FrameQueue::new(2 * MAX_FRAME_LEN).unwrap().split();
    let io = thread::spawn(move || {
        let mut link = Link::new();
        let mut source = StreamFrames::new(&stream[..]);
        link.fill_queue(&mut source, &mut writer).unwrap();
        link.stats().total_frames
    });

    let (mut stack, products) = stack();
    stack.receive_queue(&mut reader).unwrap();

    assert_eq!(io.join().unwrap(), 5);
    assert_eq!(products.len(), 1);
}

/// Re-encode `frame` with its block number and data block replaced.
fn altered_block(frame: &[u8], block_num: u16, data: Option<&[u8]>) -> Vec<u8> {
    let frame = Frame::decode(frame).unwrap();
    let mut pdh = frame.pdh.unwrap();
    pdh.block_num = block_num;
    let mut out = Vec::new();
    Frame {
        pdh: Some(pdh),
        data: data.unwrap_or(frame.data),
        ..frame
    }
    .encode_into(&mut out)
    .unwrap();
    out
}

#[test]
fn test_bad_blocks_dropped_between_products() {
    let compressed = fixture_gini("goes_east_ir_z.gini");
    let uncompressed = fixture_gini("goes_east_ir.gini");
    let mut sender = Sender::new(Vec::<Vec<u8>>::new()).with_run(1);
    send_gini(&compressed, &mut sender).unwrap();
    send_gini(&uncompressed, &mut sender).unwrap();
    let mut frames = sender.into_inner();
    assert_eq!(frames.len(), 7);

    // a block number beyond the image, then a block holding far more records than the
    // image has, both ahead of the real block 2
    let beyond = altered_block(&frames[1], 40, None);
    let oversized = codec::pack_vec(&vec![7u8; 40 * 64]).unwrap();
    let overfull = altered_block(&frames[2], 2, Some(&oversized));
    frames.insert(2, overfull);
    frames.insert(2, beyond);

    let stream = frames.concat();
    let (mut stack, products) = stack();
    let mut source = StreamFrames::new(&stream[..]);
    stack.receive_source(&mut source).unwrap();

    let products = products.products();
    assert_eq!(products.len(), 2);
    assert_eq!(
        products[0].data,
        std::fs::read(fixture_path("goes_east_ir_z.gini")).unwrap()
    );
    assert_eq!(
        products[1].data,
        std::fs::read(fixture_path("goes_east_ir.gini")).unwrap()
    );
    assert_eq!(stack.transport_stats().products, 2);
    assert_eq!(stack.link_stats().total_frames, 9);
}
