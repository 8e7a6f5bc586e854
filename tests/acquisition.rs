use std::net::{Ipv4Addr, SocketAddr};
use std::thread;
use std::time::{Duration, Instant};

use argus::capture::PixelFormat;
use argus::device::sim::{SimDevice, SimEvent, SimParameter};
use argus::device::{OperationalCode, ParameterHandle, ParameterValue, StreamError, Transport};
use argus::pipeline::Released;
use argus::{AcquisitionState, Camera, CameraError, Config, ParameterReading};

fn mono_device() -> SimDevice {
    SimDevice::builder()
        .resolution(4, 4)
        .pixel_format(PixelFormat::Mono8)
        .build()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

fn failures(count: usize) -> Vec<SimEvent> {
    (0..count)
        .map(|i| SimEvent::transport_failure(&format!("lost link {i}")))
        .collect()
}

#[test]
fn ten_consecutive_failures_abort_the_session() {
    let device = mono_device();
    device.inject(failures(10));

    let mut camera = Camera::new(device, Config::default());
    camera.open().unwrap();
    camera.start_acquisition().unwrap();

    assert!(matches!(
        camera.get_image(),
        Err(CameraError::AcquisitionStopped)
    ));
    assert_eq!(camera.acquisition_state(), AcquisitionState::Terminated);
    assert!(!camera.is_acquiring());
    assert_eq!(camera.device().queued_buffer_count(), 0);

    match camera.close() {
        Err(CameraError::AcquisitionAborted {
            consecutive,
            diagnostics,
        }) => {
            assert_eq!(consecutive, 10);
            assert_eq!(diagnostics.len(), 10);
            assert!(diagnostics[9].contains("lost link 9"));
        }
        other => panic!("unexpected close result {other:?}"),
    }
    assert!(!camera.device().is_stream_open());
    assert_eq!(camera.device().discarded_on_close(), 0);
    assert_eq!(camera.last_release().map(|r| r.missing()), Some(0));

    // Still stopped after close
    assert!(matches!(
        camera.get_image(),
        Err(CameraError::AcquisitionStopped)
    ));
}

#[test]
fn operational_failures_count_toward_the_threshold() {
    let device = mono_device();
    device.inject((0..10).map(|_| SimEvent::OperationalFailure(OperationalCode::MissingPackets)));

    let mut camera = Camera::new(device, Config::default());
    camera.open().unwrap();
    camera.start_acquisition().unwrap();

    assert!(matches!(
        camera.get_image(),
        Err(CameraError::AcquisitionStopped)
    ));
    assert!(matches!(
        camera.close(),
        Err(CameraError::AcquisitionAborted { consecutive: 10, .. })
    ));
}

#[test]
fn nine_failures_then_a_frame_keeps_running() {
    let device = mono_device();
    device.inject(failures(9));
    let pixels: Vec<u8> = (0..16).collect();
    device.inject([SimEvent::image(PixelFormat::Mono8, 4, 4, pixels.clone())]);

    let mut camera = Camera::new(device, Config::default());
    camera.open().unwrap();
    camera.start_acquisition().unwrap();

    let frame = camera.get_image().unwrap();
    assert_eq!(&frame.data[..], pixels.as_slice());
    assert_eq!(frame.meta.sequence, 1);
    assert_eq!(frame.meta.width, 4);
    assert_eq!(frame.meta.format, PixelFormat::Mono8);

    assert_eq!(camera.acquisition_state(), AcquisitionState::Running);
    assert!(camera.is_acquiring());

    camera.stop_acquisition().unwrap();
    camera.close().unwrap();
    assert_eq!(camera.acquisition_state(), AcquisitionState::Terminated);
}

#[test]
fn close_drains_every_queued_buffer() {
    let device = SimDevice::builder().queue_max(64).build();
    let mut camera = Camera::new(device, Config::default());
    camera.open().unwrap();

    assert_eq!(camera.device().queued_buffer_count(), 16);
    assert_eq!(camera.acquisition_state(), AcquisitionState::Idle);

    camera.close().unwrap();
    // Every buffer came out of the stream before it was closed
    assert_eq!(camera.device().discarded_on_close(), 0);
    assert_eq!(
        camera.last_release(),
        Some(Released {
            allocated: 16,
            returned: 16
        })
    );
    assert_eq!(camera.device().queued_buffer_count(), 0);
    assert_eq!(camera.acquisition_state(), AcquisitionState::Terminated);
    assert!(!camera.device().is_stream_open());
    assert!(matches!(
        camera.get_image(),
        Err(CameraError::AcquisitionStopped)
    ));
}

#[test]
fn close_while_running_drains_frames_in_flight() {
    let device = SimDevice::builder()
        .resolution(4, 4)
        .pixel_format(PixelFormat::Mono8)
        .frame_interval(Some(Duration::from_millis(1)))
        .build();
    let mut camera = Camera::new(device, Config::default());
    camera.open().unwrap();
    camera.start_acquisition().unwrap();

    assert!(camera
        .get_image_timeout(Duration::from_secs(2))
        .unwrap()
        .is_some());
    assert_eq!(camera.acquisition_state(), AcquisitionState::Running);

    camera.close().unwrap();
    assert_eq!(camera.acquisition_state(), AcquisitionState::Terminated);
    assert_eq!(camera.device().discarded_on_close(), 0);
    assert_eq!(
        camera.last_release(),
        Some(Released {
            allocated: 16,
            returned: 16
        })
    );
    assert!(!camera.device().is_stream_open());
}

#[test]
fn refused_requeue_returns_the_buffer_to_the_pool() {
    let device = mono_device();
    device.inject([SimEvent::image(PixelFormat::Mono8, 4, 4, vec![1; 16])]);

    let mut camera = Camera::new(device, Config::default());
    camera.open().unwrap();

    camera.device().refuse_queue(Some(StreamError::QueueFull { maximum: 16 }));
    camera.start_acquisition().unwrap();
    camera.get_image().unwrap();
    assert!(wait_until(Duration::from_secs(2), || camera.returned_buffers() == 1));
    assert_eq!(camera.device().queued_buffer_count(), 15);

    camera.device().refuse_queue(None);
    camera.close().unwrap();
    assert_eq!(
        camera.last_release(),
        Some(Released {
            allocated: 16,
            returned: 16
        })
    );
}

#[test]
fn pool_respects_stream_admission_limit() {
    let device = SimDevice::builder().queue_max(3).build();
    let mut camera = Camera::new(device, Config::default());
    camera.open().unwrap();
    assert_eq!(camera.device().queued_buffer_count(), 3);
    camera.close().unwrap();
}

#[test]
fn failed_open_never_starts_acquisition() {
    let device = mono_device();
    device.fail_open(Some(StreamError::Transport {
        code: -1,
        description: "no route to host".into(),
    }));

    let mut camera = Camera::new(device, Config::default());
    match camera.open() {
        Err(CameraError::StreamOpen { connection_id, .. }) => assert_eq!(connection_id, "sim://0"),
        other => panic!("unexpected open result {other:?}"),
    }
    assert!(!camera.is_open());
    assert!(!camera.is_acquiring());
    assert!(matches!(camera.get_image(), Err(CameraError::NotOpen)));
    assert!(matches!(camera.start_acquisition(), Err(CameraError::NotOpen)));
    assert!(matches!(camera.close(), Err(CameraError::NotOpen)));

    camera.device().fail_open(None);
    camera.open().unwrap();
    camera.close().unwrap();
}

#[test]
fn second_open_is_refused() {
    let mut camera = Camera::new(mono_device(), Config::default());
    camera.open().unwrap();
    assert!(matches!(camera.open(), Err(CameraError::AlreadyOpen)));
    camera.close().unwrap();
}

#[test]
fn deep_formats_are_switched_to_eight_bit() {
    let device = SimDevice::builder()
        .resolution(8, 6)
        .pixel_format(PixelFormat::BayerRG12)
        .build();
    let mut camera = Camera::new(device, Config::default());
    camera.open().unwrap();

    assert_eq!(
        camera.get_parameter("PixelFormat").unwrap(),
        Some(ParameterReading::Enumeration("BayerRG8".into()))
    );
    assert_eq!(camera.output_format(), Some(PixelFormat::Rgb8));
    camera.close().unwrap();
}

#[test]
fn unreadable_pixel_format_does_not_fail_open() {
    let device = SimDevice::builder()
        .resolution(8, 6)
        .pixel_format(PixelFormat::BayerRG12)
        .build();
    let format = device.params().lookup("PixelFormat").unwrap();
    format.fail_reads(Some("register timeout"));

    let mut camera = Camera::new(device, Config::default());
    camera.open().unwrap();
    assert!(camera.is_open());
    assert_eq!(camera.output_format(), None);
    assert_eq!(format.writes(), 0);
    camera.close().unwrap();
}

#[test]
fn raw_mode_leaves_the_format_alone() {
    let device = SimDevice::builder()
        .pixel_format(PixelFormat::Mono12)
        .build();
    let mut config = Config::default();
    config.capture.normalize_format = false;

    let mut camera = Camera::new(device, config);
    camera.open().unwrap();
    assert_eq!(
        camera.get_parameter("PixelFormat").unwrap(),
        Some(ParameterReading::Enumeration("Mono12".into()))
    );
    assert_eq!(camera.output_format(), None);
    camera.close().unwrap();
}

#[test]
fn gige_stream_is_tuned_on_open() {
    let mut camera = Camera::new(mono_device(), Config::default());
    camera.open().unwrap();

    let device = camera.device();
    assert!(device.packet_size_negotiated());
    assert_eq!(
        device.destination(),
        Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 50_000)))
    );
    let stream_params = device.stream_params();
    assert_eq!(
        stream_params.lookup("MaximumResendGroupSize").unwrap().value().unwrap(),
        ParameterValue::Integer(5000)
    );
    assert_eq!(
        stream_params
            .lookup("MaximumResendRequestRetryByPacket")
            .unwrap()
            .value()
            .unwrap(),
        ParameterValue::Integer(5)
    );
    assert_eq!(camera.device_name(), Some("Argus Simulated Camera"));
    camera.close().unwrap();
}

#[test]
fn usb3_stream_skips_gige_setup() {
    let device = SimDevice::builder()
        .transport(Transport::Usb3Vision)
        .model_name("Bench USB3")
        .build();
    let mut camera = Camera::new(device, Config::default());
    camera.open().unwrap();

    let device = camera.device();
    assert!(!device.packet_size_negotiated());
    assert_eq!(device.destination(), None);
    assert_eq!(
        device
            .stream_params()
            .lookup("MaximumResendGroupSize")
            .unwrap()
            .value()
            .unwrap(),
        ParameterValue::Integer(1000)
    );
    assert_eq!(camera.device_name(), Some("Bench USB3"));
    camera.close().unwrap();
}

#[test]
fn generated_frames_flow_end_to_end() {
    let device = SimDevice::builder()
        .resolution(8, 6)
        .pixel_format(PixelFormat::BayerGB8)
        .frame_interval(Some(Duration::from_millis(5)))
        .build();
    let mut camera = Camera::new(device, Config::default());
    camera.open().unwrap();

    // Idle: nothing is published
    assert!(camera
        .get_image_timeout(Duration::from_millis(50))
        .unwrap()
        .is_none());

    camera.start_acquisition().unwrap();
    assert!(camera.device().is_streaming());
    assert_eq!(
        camera
            .device()
            .params()
            .lookup("AcquisitionStart")
            .unwrap()
            .executions(),
        1
    );

    let mut last = 0;
    for _ in 0..3 {
        let frame = camera
            .get_image_timeout(Duration::from_secs(2))
            .unwrap()
            .expect("frame");
        assert_eq!(frame.meta.format, PixelFormat::Rgb8);
        assert_eq!(frame.meta.stride, 8 * 3);
        assert_eq!(frame.data.len(), 8 * 6 * 3);
        assert!(frame.meta.sequence > last);
        last = frame.meta.sequence;
    }

    camera.stop_acquisition().unwrap();
    assert!(!camera.device().is_streaming());
    assert!(wait_until(Duration::from_secs(2), || {
        camera.acquisition_state() == AcquisitionState::Idle
    }));

    let stats = camera.frame_stats();
    assert!(stats.published >= 3);
    assert!(stats.consumed >= 3);

    camera.close().unwrap();
}

#[test]
fn failed_stream_enable_leaves_the_loop_idle() {
    let device = mono_device();
    device.fail_enable(Some(StreamError::Transport {
        code: -3,
        description: "stream channel busy".into(),
    }));

    let mut camera = Camera::new(device, Config::default());
    camera.open().unwrap();
    assert!(matches!(
        camera.start_acquisition(),
        Err(CameraError::Stream(StreamError::Transport { code: -3, .. }))
    ));
    let stop = camera.device().params().lookup("AcquisitionStop").unwrap();
    assert_eq!(stop.executions(), 1);

    thread::sleep(Duration::from_millis(50));
    assert_eq!(camera.acquisition_state(), AcquisitionState::Idle);
    assert!(!camera.device().is_streaming());

    camera.device().fail_enable(None);
    camera.start_acquisition().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        camera.acquisition_state() == AcquisitionState::Running
    }));
    camera.close().unwrap();
}

#[test]
fn stopped_acquisition_leaves_payloads_queued() {
    let mut camera = Camera::new(mono_device(), Config::default());
    camera.open().unwrap();
    camera.start_acquisition().unwrap();
    camera.stop_acquisition().unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        camera.acquisition_state() == AcquisitionState::Idle
    }));

    camera
        .device()
        .inject([SimEvent::image(PixelFormat::Mono8, 4, 4, vec![7; 16])]);
    assert!(camera
        .get_image_timeout(Duration::from_millis(100))
        .unwrap()
        .is_none());
    assert_eq!(camera.device().pending_events(), 1);

    camera.start_acquisition().unwrap();
    let frame = camera.get_image().unwrap();
    assert_eq!(&frame.data[..], &[7u8; 16]);
    camera.close().unwrap();
}

#[test]
fn exposure_steps_are_range_checked_before_writing() {
    let camera = Camera::new(mono_device(), Config::default());
    let exposure = camera
        .device()
        .params()
        .insert(SimParameter::float("ExposureTime", 1000.0, 5000.0, 9000.0));

    assert_eq!(
        camera.step_parameter("ExposureTime", 1000.0).unwrap(),
        ParameterValue::Float(6000.0)
    );
    assert_eq!(exposure.writes(), 1);

    match camera.step_parameter("ExposureTime", 4000.0) {
        Err(CameraError::ParameterOutOfRange {
            requested, max, ..
        }) => {
            assert_eq!(requested, 10_000.0);
            assert_eq!(max, 9000.0);
        }
        other => panic!("unexpected step result {other:?}"),
    }
    assert_eq!(exposure.writes(), 1);
    assert_eq!(exposure.value().unwrap(), ParameterValue::Float(6000.0));
}

#[test]
fn parameter_errors_name_the_parameter() {
    let camera = Camera::new(mono_device(), Config::default());
    let gain = camera.device().params().lookup("Gain").unwrap();

    gain.set_available(false);
    match camera.set_parameter("Gain", 2.0) {
        Err(CameraError::ParameterNotAvailable { name }) => assert_eq!(name, "Gain"),
        other => panic!("unexpected {other:?}"),
    }

    gain.set_available(true);
    gain.set_readable(false);
    assert!(matches!(
        camera.set_parameter("Gain", 2.0),
        Err(CameraError::ParameterNotReadable { .. })
    ));

    gain.set_readable(true);
    gain.fail_writes(Some("device busy"));
    match camera.set_parameter("Gain", 2.0) {
        Err(CameraError::ParameterSetFailure { name, description }) => {
            assert_eq!(name, "Gain");
            assert_eq!(description, "device busy");
        }
        other => panic!("unexpected {other:?}"),
    }

    assert_eq!(camera.get_parameter("NoSuchFeature").unwrap(), None);
}
