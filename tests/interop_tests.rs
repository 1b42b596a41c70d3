// File collections, handles and callbacks through FileReaderInterop

mod common;

use common::{text_file, Harness, MODES};
use file_reader::host::{MemoryHostConfig, MemoryScriptHost};
use file_reader::protocol::{callbacks, CallbackId};
use file_reader::{FileReaderError, SharedBuffer, TransferPreference};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn three_files() -> Vec<std::sync::Arc<file_reader::MemoryFile>> {
    vec![
        text_file("a.txt", b"first"),
        text_file("b.txt", b"second file"),
        text_file("c.txt", b"third"),
    ]
}

#[tokio::test]
async fn test_file_count_and_info() {
    let files = three_files();
    let h = Harness::new(TransferPreference::Auto, files.clone());

    assert_eq!(h.reader.get_file_count(h.input).await.unwrap(), Some(3));

    let info = h
        .reader
        .get_file_info_from_element(h.input, 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info, files[1].info());
    assert_eq!(info.name, "b.txt");
    assert_eq!(info.size, 11);
    assert_eq!(info.mime_type, "text/plain");
    assert_eq!(
        info.last_modified_utc().unwrap().to_rfc3339(),
        "2023-11-14T22:13:20+00:00"
    );

    assert_eq!(
        h.reader.get_file_info_from_element(h.input, 3).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn test_open_errors() {
    let h = Harness::new(TransferPreference::Auto, three_files());

    let err = h.reader.open(h.input, 3).await.unwrap_err();
    assert_eq!(err, FileReaderError::IndexOutOfRange { index: 3, count: 3 });

    let zone = h.host.add_drop_zone();
    assert_eq!(h.reader.get_file_count(zone).await.unwrap(), None);
    let err = h.reader.open(zone, 0).await.unwrap_err();
    assert_eq!(err, FileReaderError::NoFileCollection);

    assert_eq!(h.host.open_file_count(), 0);
}

#[tokio::test]
async fn test_handle_info_and_refresh() {
    let h = Harness::new(TransferPreference::Auto, three_files());
    let mut handle = h.reader.open(h.input, 2).await.unwrap();
    assert_eq!(handle.info().name, "c.txt");
    assert_eq!(handle.len(), 5);

    let from_ref = h
        .reader
        .get_file_info_from_reference(handle.file_ref())
        .await
        .unwrap();
    assert_eq!(&from_ref, handle.info());

    let refreshed = handle.refresh_info().await.unwrap().clone();
    assert_eq!(refreshed, from_ref);

    handle.dispose().await.unwrap();
    let err = handle.refresh_info().await.unwrap_err();
    assert_eq!(err, FileReaderError::InvalidReference(handle.file_ref()));
}

#[tokio::test]
async fn test_each_open_gets_a_new_reference() {
    let h = Harness::new(TransferPreference::Auto, three_files());
    let first = h.reader.open(h.input, 0).await.unwrap();
    let second = h.reader.open(h.input, 0).await.unwrap();
    assert_ne!(first.file_ref(), second.file_ref());
    assert_eq!(h.host.open_file_count(), 2);

    assert!(first.dispose().await.unwrap());
    assert!(second.dispose().await.unwrap());
    assert_eq!(h.host.open_file_count(), 0);
}

#[tokio::test]
async fn test_dropped_handle_is_released() {
    let h = Harness::new(TransferPreference::Auto, three_files());
    let handle = h.reader.open(h.input, 0).await.unwrap();
    let file_ref = handle.file_ref();
    drop(handle);

    for _ in 0..100 {
        if h.host.open_file_count() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.host.open_file_count(), 0);
    assert!(!h.reader.is_open(file_ref));
}

#[tokio::test]
async fn test_drop_events_additive() {
    let files = three_files();
    let h = Harness::new(TransferPreference::Auto, vec![]);
    let zone = h.host.add_drop_zone();

    assert!(h.reader.register_drop_events(zone, true).await.unwrap());
    assert!(h.host.drop_files(zone, vec![files[0].clone(), files[1].clone()]));
    assert!(h.host.drop_files(zone, vec![files[1].clone(), files[2].clone()]));
    assert_eq!(h.reader.get_file_count(zone).await.unwrap(), Some(3));

    let mut stream = h.reader.open_file_stream(zone, 2).await.unwrap();
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"third");
    stream.dispose().await.unwrap();

    h.reader.clear_value(zone).await.unwrap();
    assert_eq!(h.reader.get_file_count(zone).await.unwrap(), None);

    assert!(h.reader.unregister_drop_events(zone).await.unwrap());
    assert!(!h.host.drop_files(zone, vec![files[0].clone()]));
    assert_eq!(h.reader.get_file_count(zone).await.unwrap(), None);
}

#[tokio::test]
async fn test_drop_events_replace() {
    let files = three_files();
    let h = Harness::new(TransferPreference::Auto, vec![]);
    let zone = h.host.add_drop_zone();

    h.reader.register_drop_events(zone, false).await.unwrap();
    h.host.drop_files(zone, vec![files[0].clone(), files[1].clone()]);
    h.host.drop_files(zone, vec![files[2].clone()]);
    assert_eq!(h.reader.get_file_count(zone).await.unwrap(), Some(1));
    let info = h.reader.get_file_info_from_element(zone, 0).await.unwrap().unwrap();
    assert_eq!(info.name, "c.txt");
}

#[tokio::test]
async fn test_clear_value_on_input() {
    let h = Harness::new(TransferPreference::Auto, three_files());
    h.reader.clear_value(h.input).await.unwrap();
    assert_eq!(h.reader.get_file_count(h.input).await.unwrap(), Some(0));
    let err = h.reader.open(h.input, 0).await.unwrap_err();
    assert_eq!(err, FileReaderError::IndexOutOfRange { index: 0, count: 0 });
}

#[tokio::test]
async fn test_script_read_error_surfaces() {
    for mode in MODES {
        let h = Harness::new(mode, three_files());
        h.host.fail_reads_of("b.txt", "NotReadableError");

        let bad = h.reader.open(h.input, 1).await.unwrap();
        let buffer = SharedBuffer::new(8);
        let cancel = CancellationToken::new();
        let err = bad.read_at(&buffer, 0, 0, 8, &cancel).await.unwrap_err();
        assert_eq!(
            err,
            FileReaderError::TransferFailure("NotReadableError".to_string())
        );
        assert_eq!(h.reader.pending_reads(), 0);

        // Other files are unaffected
        let good = h.reader.open(h.input, 0).await.unwrap();
        let n = good.read_at(&buffer, 0, 0, 8, &cancel).await.unwrap();
        assert_eq!(buffer.to_vec(0, n), b"first");
    }
}

#[tokio::test]
async fn test_concurrent_reads_on_separate_handles() {
    for mode in MODES {
        let h = Harness::with_host(
            MemoryHostConfig::default().with_callback_delay(Duration::from_millis(2)),
            common::reader_config(mode),
            three_files(),
        );
        let a = h.reader.open(h.input, 0).await.unwrap();
        let b = h.reader.open(h.input, 1).await.unwrap();
        let cancel = CancellationToken::new();
        let buf_a = SharedBuffer::new(16);
        let buf_b = SharedBuffer::new(16);

        let (na, nb) = tokio::join!(
            a.read_at(&buf_a, 0, 0, 16, &cancel),
            b.read_at(&buf_b, 0, 0, 16, &cancel),
        );
        assert_eq!(buf_a.to_vec(0, na.unwrap()), b"first");
        assert_eq!(buf_b.to_vec(0, nb.unwrap()), b"second file");
        assert_eq!(h.reader.pending_reads(), 0);
    }
}

#[tokio::test]
async fn test_independent_readers_share_nothing() {
    let host_a = MemoryScriptHost::default();
    let host_b = MemoryScriptHost::new(MemoryHostConfig::encoded_only());
    let input_a = host_a.add_input(vec![text_file("a.txt", b"alpha")]);
    let input_b = host_b.add_input(vec![text_file("b.txt", b"bravo")]);
    let reader_a = host_a.reader(common::reader_config(TransferPreference::Auto)).unwrap();
    let reader_b = host_b.reader(common::reader_config(TransferPreference::Auto)).unwrap();
    assert_ne!(reader_a.transfer_mode(), reader_b.transfer_mode());

    let mut stream_a = reader_a.open_file_stream(input_a, 0).await.unwrap();
    let mut stream_b = reader_b.open_file_stream(input_b, 0).await.unwrap();

    let mut buf_a = [0u8; 8];
    let mut buf_b = [0u8; 8];
    let (na, nb) = tokio::join!(stream_a.read(&mut buf_a), stream_b.read(&mut buf_b));
    assert_eq!(&buf_a[..na.unwrap()], b"alpha");
    assert_eq!(&buf_b[..nb.unwrap()], b"bravo");

    // Same reference number on both sides, but each reader only knows its own
    assert!(reader_a.is_open(stream_a.handle().file_ref()));
    stream_a.dispose().await.unwrap();
    assert!(reader_b.is_open(stream_b.handle().file_ref()));
}

#[tokio::test]
async fn test_stray_callbacks_are_ignored() {
    let h = Harness::new(TransferPreference::Auto, three_files());
    let dispatcher = h.reader.callbacks();

    let args = serde_json::json!({"callBackId": CallbackId::Sequence(999), "bytesRead": 3});
    assert!(!dispatcher.dispatch(callbacks::READ_FILE, &args.to_string()));

    let args = serde_json::json!({"callBackId": CallbackId::token(), "data": "QUJD"});
    assert!(!dispatcher.dispatch(callbacks::READ_FILE_MARSHALLED, &args.to_string()));

    assert!(!dispatcher.dispatch(callbacks::READ_FILE_ERROR, "{"));

    // The reader is unaffected
    let mut stream = h.reader.open_file_stream(h.input, 0).await.unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(stream.read(&mut buf).await.unwrap(), 5);
}

#[tokio::test]
async fn test_read_argument_checks() {
    let h = Harness::new(TransferPreference::Auto, three_files());
    let handle = h.reader.open(h.input, 0).await.unwrap();
    let cancel = CancellationToken::new();

    let buffer = SharedBuffer::new(4);
    let err = handle.read_at(&buffer, 0, 0, 5, &cancel).await.unwrap_err();
    assert!(matches!(err, FileReaderError::InvalidArgument(_)));
    let err = handle.read_at(&buffer, usize::MAX, 0, 1, &cancel).await.unwrap_err();
    assert!(matches!(err, FileReaderError::InvalidArgument(_)));

    let err = handle
        .read_at(&buffer, 0, 0, i32::MAX as usize + 1, &cancel)
        .await
        .unwrap_err();
    match err {
        FileReaderError::InvalidArgument(msg) => assert!(msg.contains("too large"), "{msg}"),
        other => panic!("expected InvalidArgument, got {other:?}"),
    }

    assert_eq!(handle.read_at(&buffer, 4, 0, 0, &cancel).await.unwrap(), 0);
    assert_eq!(h.host.metrics().reads_started, 0);
}
