//! Synchronous transfers: interface claiming, HID output reports and feature
//! report round trips.

use crate::consts;
use crate::device::{Connection, DeviceHandle, Subsystem};
use crate::error::{closed_handle, unsupported, Error, Result};
use hidapi::{HidDevice, HidResult};
use log::{debug, error, trace, warn};
use std::time::Duration;

/// Control pipe of a libusb device.
pub(crate) trait ControlPipe {
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;
}

impl ControlPipe for rusb::DeviceHandle<rusb::Context> {
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        rusb::DeviceHandle::write_control(self, request_type, request, value, index, buf, timeout)
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        rusb::DeviceHandle::read_control(self, request_type, request, value, index, buf, timeout)
    }
}

/// Report I/O of a hidapi device.
pub(crate) trait ReportPipe {
    fn write(&self, data: &[u8]) -> HidResult<usize>;
    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> HidResult<usize>;
    fn send_feature_report(&self, data: &[u8]) -> HidResult<()>;
    fn get_feature_report(&self, buf: &mut [u8]) -> HidResult<usize>;
}

impl ReportPipe for HidDevice {
    fn write(&self, data: &[u8]) -> HidResult<usize> {
        HidDevice::write(self, data)
    }

    fn read_timeout(&self, buf: &mut [u8], timeout_ms: i32) -> HidResult<usize> {
        HidDevice::read_timeout(self, buf, timeout_ms)
    }

    fn send_feature_report(&self, data: &[u8]) -> HidResult<()> {
        HidDevice::send_feature_report(self, data)
    }

    fn get_feature_report(&self, buf: &mut [u8]) -> HidResult<usize> {
        HidDevice::get_feature_report(self, buf)
    }
}

/// One alternate setting of one interface, as listed in a configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AltSetting {
    pub interface_number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// Buffers of a feature report round trip.
enum Exchange<'a> {
    /// Request from `data`, response into a separate buffer of the same length.
    Fresh { data: &'a [u8], out: &'a mut [u8] },
    /// Request from and response into the caller's buffer.
    InPlace(&'a mut [u8]),
}

impl Exchange<'_> {
    fn request(&self) -> &[u8] {
        match self {
            Exchange::Fresh { data, .. } => data,
            Exchange::InPlace(buf) => buf,
        }
    }

    fn response(&mut self) -> &mut [u8] {
        match self {
            Exchange::Fresh { out, .. } => out,
            Exchange::InPlace(buf) => buf,
        }
    }

    fn len(&self) -> usize {
        self.request().len()
    }
}

impl DeviceHandle {
    // --- Interface Claiming ---

    /// Claims every interface with an alternate setting matching the
    /// (`class`, `subclass`, `protocol`) triple.
    ///
    /// Individual claim failures are logged and skipped. Returns the number
    /// of matching alternate settings claimed, or 0 when the configuration
    /// descriptors cannot be read.
    ///
    /// hidapi handles need no claiming on Windows (returns 1); elsewhere the
    /// call is unsupported for them (returns 0).
    pub fn claim_interfaces_by(&self, class: u8, subclass: u8, protocol: u8) -> usize {
        let usb = match &self.connection {
            Connection::Usb(usb) => usb,
            Connection::Hid(_) => {
                if cfg!(windows) {
                    return 1;
                }
                warn!("{}", unsupported("claim_interfaces_by", Subsystem::HidApi));
                return 0;
            }
            Connection::Closed => {
                warn!("{}", closed_handle("claim_interfaces_by"));
                return 0;
            }
        };

        let mut usb = usb.borrow_mut();
        let alt_settings = match list_alt_settings(&usb.device()) {
            Ok(alt_settings) => alt_settings,
            Err(e) => {
                error!("Failed to read configuration descriptor of {}: {}", self, e);
                return 0;
            }
        };

        // Kernel drivers are detached by libusb itself: auto-detach is
        // enabled when the device is opened.
        let count = claim_matching(&alt_settings, (class, subclass, protocol), |number| {
            usb.claim_interface(number).map_err(Error::from)
        });
        debug!(
            "Claimed {} interface(s) of class {:02X}/{:02X}/{:02X} on {}",
            count, class, subclass, protocol, self
        );
        count
    }

    // --- HID Reports ---

    /// Sends a SET_REPORT request (libusb) or an output report (hidapi).
    ///
    /// Best effort: failures are logged and otherwise ignored.
    pub fn hid_write(&self, index: u16, data: &[u8]) {
        trace!("hid_write to {} index {}: {:02X?}", self, index, data);
        let result = match &self.connection {
            Connection::Usb(usb) => set_report(&*usb.borrow(), index, data, self.control_timeout),
            Connection::Hid(hid) => hid.write(data).map(|_| ()).map_err(Error::Hid),
            Connection::Closed => Err(closed_handle("hid_write")),
        };
        if let Err(e) = result {
            error!("hid_write to {} failed: {}", self, e);
        }
    }

    /// Sends `data[..length]` as a feature report and reads the response into
    /// a new buffer of exactly `length` bytes.
    pub fn hid_request(&self, index: u16, data: &[u8], length: usize) -> Result<Vec<u8>> {
        if data.len() < length {
            let e = Error::BufferTooSmall {
                expected: length,
                actual: data.len(),
            };
            error!("hid_request to {} failed: {}", self, e);
            return Err(e);
        }

        let mut out = Vec::new();
        if out.try_reserve_exact(length).is_err() {
            error!("hid_request to {}: out of memory", self);
            return Err(Error::Allocation(format!(
                "{} byte feature report buffer",
                length
            )));
        }
        out.resize(length, 0);

        self.feature_exchange(
            index,
            Exchange::Fresh {
                data: &data[..length],
                out: &mut out,
            },
        )?;
        Ok(out)
    }

    /// Sends `buffer` as a feature report and reads the response back into it.
    pub fn hid_request_in_place(&self, index: u16, buffer: &mut [u8]) -> Result<()> {
        self.feature_exchange(index, Exchange::InPlace(buffer))
    }

    fn feature_exchange(&self, index: u16, mut exchange: Exchange<'_>) -> Result<()> {
        let result = match &self.connection {
            Connection::Usb(usb) => {
                feature_round_trip(&*usb.borrow(), index, &mut exchange, self.control_timeout)
            }
            Connection::Hid(hid) => {
                hid_feature_round_trip(&**hid, self.interface(), index, &mut exchange)
            }
            Connection::Closed => Err(closed_handle("hid_request")),
        };
        match result {
            Ok(()) => {
                trace!("hid_request to {} returned {:02X?}", self, exchange.response());
                Ok(())
            }
            Err(e) => {
                error!("hid_request to {} failed: {}", self, e);
                Err(e)
            }
        }
    }
}

fn list_alt_settings<T: rusb::UsbContext>(device: &rusb::Device<T>) -> rusb::Result<Vec<AltSetting>> {
    let mut found = Vec::new();
    for config_index in 0..=u8::MAX {
        let config = match device.config_descriptor(config_index) {
            Ok(config) => config,
            Err(rusb::Error::NotFound) => break,
            Err(e) => return Err(e),
        };
        for interface in config.interfaces() {
            for alt in interface.descriptors() {
                found.push(AltSetting {
                    interface_number: alt.interface_number(),
                    class: alt.class_code(),
                    subclass: alt.sub_class_code(),
                    protocol: alt.protocol_code(),
                });
            }
        }
    }
    Ok(found)
}

/// Claims the interface of every alternate setting matching `triple`.
/// Returns how many claims succeeded.
pub(crate) fn claim_matching<F>(alt_settings: &[AltSetting], triple: (u8, u8, u8), mut claim: F) -> usize
where
    F: FnMut(u8) -> Result<()>,
{
    let (class, subclass, protocol) = triple;
    let mut count = 0;
    for alt in alt_settings
        .iter()
        .filter(|alt| alt.class == class && alt.subclass == subclass && alt.protocol == protocol)
    {
        match claim(alt.interface_number) {
            Ok(()) => count += 1,
            // Not fatal; the other interfaces may still be usable.
            Err(e) => error!("Failed to claim interface {}: {}", alt.interface_number, e),
        }
    }
    count
}

fn check_control_length(length: usize) -> Result<()> {
    if length > usize::from(u16::MAX) {
        return Err(Error::OperationTooLarge {
            max: usize::from(u16::MAX),
            actual: length,
        });
    }
    Ok(())
}

pub(crate) fn set_report<P: ControlPipe>(
    pipe: &P,
    index: u16,
    data: &[u8],
    timeout: Duration,
) -> Result<()> {
    check_control_length(data.len())?;
    pipe.write_control(
        consts::REQUEST_TYPE_CLASS_OUT,
        consts::HID_SET_REPORT,
        consts::HID_FEATURE_REPORT_VALUE,
        index,
        data,
        timeout,
    )?;
    Ok(())
}

/// SET_REPORT followed by GET_REPORT on the control pipe.
fn feature_round_trip<P: ControlPipe>(
    pipe: &P,
    index: u16,
    exchange: &mut Exchange<'_>,
    timeout: Duration,
) -> Result<()> {
    set_report(pipe, index, exchange.request(), timeout)?;
    pipe.read_control(
        consts::REQUEST_TYPE_CLASS_IN,
        consts::HID_GET_REPORT,
        consts::HID_FEATURE_REPORT_VALUE,
        index,
        exchange.response(),
        timeout,
    )?;
    Ok(())
}

/// Feature report round trip through hidapi, which wants the report id in
/// front of the payload.
fn hid_feature_round_trip<P: ReportPipe>(
    pipe: &P,
    opened: Option<u8>,
    index: u16,
    exchange: &mut Exchange<'_>,
) -> Result<()> {
    let length = exchange.len();
    if length > consts::HIDAPI_MAX_REQUEST {
        return Err(Error::OperationTooLarge {
            max: consts::HIDAPI_MAX_REQUEST,
            actual: length,
        });
    }
    if opened.map(u16::from) != Some(index) {
        return Err(Error::InterfaceMismatch {
            opened,
            requested: index,
        });
    }

    let mut report = [0u8; consts::HIDAPI_MAX_REQUEST + 1];
    report[0] = consts::HIDAPI_REPORT_ID;
    report[1..=length].copy_from_slice(exchange.request());
    pipe.send_feature_report(&report[..=length])?;
    pipe.get_feature_report(&mut report[..=length])?;
    exchange.response().copy_from_slice(&report[1..=length]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct FakeControl {
        calls: RefCell<Vec<(u8, u8, u16, u16, Vec<u8>)>>,
        response: Vec<u8>,
        fail_read: bool,
    }

    impl ControlPipe for FakeControl {
        fn write_control(
            &self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            buf: &[u8],
            _timeout: Duration,
        ) -> rusb::Result<usize> {
            self.calls
                .borrow_mut()
                .push((request_type, request, value, index, buf.to_vec()));
            Ok(buf.len())
        }

        fn read_control(
            &self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> rusb::Result<usize> {
            self.calls
                .borrow_mut()
                .push((request_type, request, value, index, Vec::new()));
            if self.fail_read {
                return Err(rusb::Error::Pipe);
            }
            let n = buf.len().min(self.response.len());
            buf[..n].copy_from_slice(&self.response[..n]);
            Ok(n)
        }
    }

    #[derive(Default)]
    struct FakeReports {
        sent: RefCell<Vec<Vec<u8>>>,
        feature: Vec<u8>,
    }

    impl ReportPipe for FakeReports {
        fn write(&self, data: &[u8]) -> HidResult<usize> {
            self.sent.borrow_mut().push(data.to_vec());
            Ok(data.len())
        }

        fn read_timeout(&self, _buf: &mut [u8], _timeout_ms: i32) -> HidResult<usize> {
            Ok(0)
        }

        fn send_feature_report(&self, data: &[u8]) -> HidResult<()> {
            self.sent.borrow_mut().push(data.to_vec());
            Ok(())
        }

        fn get_feature_report(&self, buf: &mut [u8]) -> HidResult<usize> {
            let n = buf.len().min(self.feature.len());
            buf[..n].copy_from_slice(&self.feature[..n]);
            Ok(n)
        }
    }

    #[test]
    fn test_set_report_uses_hid_class_request() {
        let pipe = FakeControl::default();
        set_report(&pipe, 2, &[0x87, 0x03], consts::DEFAULT_CONTROL_TIMEOUT).unwrap();
        assert_eq!(
            pipe.calls.borrow()[0],
            (0x21, 0x09, 0x0300, 2, vec![0x87, 0x03])
        );
    }

    #[test]
    fn test_feature_round_trip_fresh_buffer() {
        let pipe = FakeControl {
            response: vec![1, 2, 3, 4],
            ..Default::default()
        };
        let data = [0xAA; 4];
        let mut out = [0u8; 4];
        let mut exchange = Exchange::Fresh {
            data: &data,
            out: &mut out,
        };
        feature_round_trip(&pipe, 1, &mut exchange, consts::DEFAULT_CONTROL_TIMEOUT).unwrap();

        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(data, [0xAA; 4], "request buffer must be left untouched");
        let calls = pipe.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, 0xA1);
        assert_eq!(calls[1].1, 0x01);
        assert_eq!(calls[1].2, 0x0300);
    }

    #[test]
    fn test_feature_round_trip_in_place_reuses_caller_buffer() {
        let pipe = FakeControl {
            response: vec![9, 8, 7],
            ..Default::default()
        };
        let mut buffer = vec![0x10, 0x20, 0x30];
        let before = buffer.as_ptr();
        let mut exchange = Exchange::InPlace(&mut buffer);
        feature_round_trip(&pipe, 0, &mut exchange, consts::DEFAULT_CONTROL_TIMEOUT).unwrap();

        assert_eq!(buffer, [9, 8, 7]);
        assert_eq!(buffer.as_ptr(), before);
        assert_eq!(pipe.calls.borrow()[0].4, vec![0x10, 0x20, 0x30]);
    }

    #[test]
    fn test_feature_round_trip_read_failure_keeps_caller_buffer() {
        let pipe = FakeControl {
            fail_read: true,
            ..Default::default()
        };
        let mut buffer = vec![5u8; 8];
        let result = feature_round_trip(
            &pipe,
            0,
            &mut Exchange::InPlace(&mut buffer),
            consts::DEFAULT_CONTROL_TIMEOUT,
        );
        assert!(matches!(result, Err(Error::Usb(rusb::Error::Pipe))));
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn test_hidapi_round_trip_strips_report_id() {
        let pipe = FakeReports {
            feature: vec![0x00, 0xDE, 0xAD, 0xBE],
            ..Default::default()
        };
        let data = [1, 2, 3];
        let mut out = [0u8; 3];
        hid_feature_round_trip(
            &pipe,
            Some(2),
            2,
            &mut Exchange::Fresh {
                data: &data,
                out: &mut out,
            },
        )
        .unwrap();

        assert_eq!(out, [0xDE, 0xAD, 0xBE]);
        assert_eq!(pipe.sent.borrow()[0], vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_hidapi_interface_mismatch_does_no_io() {
        let pipe = FakeReports::default();
        let mut buffer = [0u8; 8];
        let result = hid_feature_round_trip(&pipe, Some(5), 3, &mut Exchange::InPlace(&mut buffer));

        match result {
            Err(Error::InterfaceMismatch { opened, requested }) => {
                assert_eq!(opened, Some(5));
                assert_eq!(requested, 3);
            }
            other => panic!("Expected InterfaceMismatch, got: {:?}", other),
        }
        assert!(pipe.sent.borrow().is_empty());
    }

    #[test]
    fn test_hidapi_without_interface_never_matches() {
        let pipe = FakeReports::default();
        let mut buffer = [0u8; 2];
        let result = hid_feature_round_trip(&pipe, None, 0, &mut Exchange::InPlace(&mut buffer));
        assert!(matches!(result, Err(Error::InterfaceMismatch { opened: None, .. })));
        assert!(pipe.sent.borrow().is_empty());
    }

    #[test]
    fn test_hidapi_request_size_limit() {
        let pipe = FakeReports::default();
        let mut buffer = vec![0u8; consts::HIDAPI_MAX_REQUEST + 1];
        let result = hid_feature_round_trip(&pipe, Some(0), 0, &mut Exchange::InPlace(&mut buffer));
        assert!(matches!(
            result,
            Err(Error::OperationTooLarge { max: 256, actual: 257 })
        ));
        assert!(pipe.sent.borrow().is_empty());

        let mut buffer = vec![0u8; consts::HIDAPI_MAX_REQUEST];
        assert!(
            hid_feature_round_trip(&pipe, Some(0), 0, &mut Exchange::InPlace(&mut buffer)).is_ok()
        );
    }

    #[test]
    fn test_claim_matching_counts_successful_claims() {
        let alt = |interface_number, class, subclass, protocol| AltSetting {
            interface_number,
            class,
            subclass,
            protocol,
        };
        let settings = [
            alt(0, 0x03, 0x00, 0x00),
            alt(1, 0xFF, 0x5D, 0x01),
            alt(1, 0xFF, 0x5D, 0x01),
            alt(2, 0xFF, 0x5D, 0x01),
            alt(3, 0xFF, 0x5D, 0x03),
        ];
        let mut attempted = Vec::new();
        let count = claim_matching(&settings, (0xFF, 0x5D, 0x01), |number| {
            attempted.push(number);
            if number == 2 {
                Err(Error::Usb(rusb::Error::Busy))
            } else {
                Ok(())
            }
        });

        assert_eq!(attempted, vec![1, 1, 2]);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_closed_handle_requests_fail() {
        let handle = DeviceHandle::closed_for_test(1, Subsystem::Usb, None);
        assert!(matches!(
            handle.hid_request(0, &[0u8; 4], 4),
            Err(Error::Misuse(_))
        ));
        assert!(matches!(
            handle.hid_request_in_place(0, &mut [0u8; 4]),
            Err(Error::Misuse(_))
        ));
        assert_eq!(handle.claim_interfaces_by(3, 0, 0), 0);
        handle.hid_write(0, &[1, 2]);
    }

    #[test]
    fn test_hid_request_rejects_short_data() {
        let handle = DeviceHandle::closed_for_test(1, Subsystem::HidApi, Some(0));
        match handle.hid_request(0, &[0u8; 2], 8) {
            Err(Error::BufferTooSmall { expected, actual }) => {
                assert_eq!(expected, 8);
                assert_eq!(actual, 2);
            }
            other => panic!("Expected BufferTooSmall, got: {:?}", other),
        }
    }
}
