// tests/path_tests.rs
use dualhid::{DevicePath, Error};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn fake_sysfs_device(busnum: &str, devnum: &str) -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    fs::write(dir.path().join("busnum"), busnum).expect("Failed to write busnum");
    fs::write(dir.path().join("devnum"), devnum).expect("Failed to write devnum");
    dir
}

fn parse_dir(dir: &Path) -> DevicePath {
    DevicePath::parse(dir.to_str().expect("temp path is UTF-8")).expect("sysfs paths always parse")
}

#[test]
fn test_sysfs_directory_resolves_to_bus_and_address() {
    let dir = fake_sysfs_device("3\n", "17\n");
    let parsed = parse_dir(dir.path());
    assert!(matches!(parsed, DevicePath::Sysfs(_)));

    let (bus, address) = parsed
        .usb_address()
        .expect("sysfs paths name libusb devices")
        .expect("attributes are readable");
    assert_eq!((bus, address), (3, 17));
}

#[test]
fn test_sysfs_numbers_are_decimal() {
    // Unlike the synthetic path, sysfs attributes are decimal.
    let dir = fake_sysfs_device("10", "099");
    let (bus, address) = parse_dir(dir.path()).usb_address().unwrap().unwrap();
    assert_eq!((bus, address), (10, 99));
}

#[test]
fn test_sysfs_missing_attribute_is_resolution_error() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("busnum"), "1").unwrap();

    match parse_dir(dir.path()).usb_address().unwrap() {
        Err(Error::AddressResolution { message, .. }) => {
            assert!(message.contains("devnum"), "message was: {}", message)
        }
        other => panic!("Expected AddressResolution error, got: {:?}", other),
    }
}

#[test]
fn test_sysfs_garbage_attribute_is_resolution_error() {
    let dir = fake_sysfs_device("usb1", "2");
    assert!(matches!(
        parse_dir(dir.path()).usb_address().unwrap(),
        Err(Error::AddressResolution { .. })
    ));

    let dir = fake_sysfs_device("1", "300");
    assert!(matches!(
        parse_dir(dir.path()).usb_address().unwrap(),
        Err(Error::AddressResolution { .. })
    ));
}

#[test]
fn test_synthetic_usb_path_needs_no_filesystem() {
    let path = DevicePath::usb_address_path(0x12, 0x0A);
    assert_eq!(path, "/win32/usb/12/a");
    assert_eq!(
        DevicePath::parse(&path).unwrap(),
        DevicePath::UsbAddress {
            bus: 0x12,
            address: 0x0A
        }
    );
}

#[test]
fn test_display_names_the_device() {
    let parsed = DevicePath::parse("/win32/usb/1/2").unwrap();
    assert_eq!(parsed.to_string(), "device 2 on bus 1");
}
