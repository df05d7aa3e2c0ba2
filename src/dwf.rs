use anyhow::{Context, Result};
use libloading::Library;
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use std::ffi::CStr;
use std::os::raw::{c_char, c_double, c_int, c_short, c_uchar, c_uint};

use crate::config::{AcquisitionConfig, PulseConfig, TriggerConfig};
use crate::drivers::{Instrument, LabError, VoltageScale};
use crate::types::{
    InstrumentStatus, SampleLoss, ScopeCapabilities, ScopeParams, Span, TriggerFilter,
    TriggerSlope, TriggerSource, TriggerTime, WaveFunction,
};

#[cfg(target_os = "windows")]
const DWF_LIBRARY: &str = "dwf.dll";
#[cfg(target_os = "macos")]
const DWF_LIBRARY: &str = "/Library/Frameworks/dwf.framework/dwf";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const DWF_LIBRARY: &str = "libdwf.so";

const HDWF_NONE: c_int = 0;
const ENUM_ALL: c_int = 0;
const PARAM_ON_CLOSE: c_int = 4;
const ON_CLOSE_RUN: c_int = 0;
const NODE_CARRIER: c_int = 0;
const IDLE_OFFSET: c_int = 1;
const FUNC_SINE: c_uchar = 1;
const FUNC_SQUARE: c_uchar = 2;
const FUNC_CUSTOM: c_uchar = 30;
const TRIGSRC_DETECTOR_ANALOG_IN: c_uchar = 2;
const TRIGSRC_EXTERNAL1: c_uchar = 11;
const TRIGTYPE_EDGE: c_int = 0;
const CUSTOM_TABLE_LEN: usize = 4096;

type Hdwf = c_int;

/// Function table of the WaveForms SDK. Every call returns a C `BOOL`,
/// non-zero on success.
struct DwfApi {
    #[allow(dead_code)]
    lib: Library,
    get_last_error_msg: unsafe extern "C" fn(*mut c_char) -> c_int,
    get_version: unsafe extern "C" fn(*mut c_char) -> c_int,
    param_set: unsafe extern "C" fn(c_int, c_int) -> c_int,
    enumerate: unsafe extern "C" fn(c_int, *mut c_int) -> c_int,
    device_open: unsafe extern "C" fn(c_int, *mut Hdwf) -> c_int,
    device_close: unsafe extern "C" fn(Hdwf) -> c_int,
    device_auto_configure_set: unsafe extern "C" fn(Hdwf, c_int) -> c_int,

    out_node_enable_set: unsafe extern "C" fn(Hdwf, c_int, c_int, c_int) -> c_int,
    out_idle_set: unsafe extern "C" fn(Hdwf, c_int, c_int) -> c_int,
    out_node_function_set: unsafe extern "C" fn(Hdwf, c_int, c_int, c_uchar) -> c_int,
    out_node_frequency_set: unsafe extern "C" fn(Hdwf, c_int, c_int, c_double) -> c_int,
    out_node_amplitude_set: unsafe extern "C" fn(Hdwf, c_int, c_int, c_double) -> c_int,
    out_node_offset_set: unsafe extern "C" fn(Hdwf, c_int, c_int, c_double) -> c_int,
    out_node_data_set: unsafe extern "C" fn(Hdwf, c_int, c_int, *const c_double, c_int) -> c_int,
    out_run_set: unsafe extern "C" fn(Hdwf, c_int, c_double) -> c_int,
    out_wait_set: unsafe extern "C" fn(Hdwf, c_int, c_double) -> c_int,
    out_repeat_set: unsafe extern "C" fn(Hdwf, c_int, c_int) -> c_int,
    out_configure: unsafe extern "C" fn(Hdwf, c_int, c_int) -> c_int,

    in_channel_count: unsafe extern "C" fn(Hdwf, *mut c_int) -> c_int,
    in_frequency_set: unsafe extern "C" fn(Hdwf, c_double) -> c_int,
    in_buffer_size_set: unsafe extern "C" fn(Hdwf, c_int) -> c_int,
    in_buffer_size_info: unsafe extern "C" fn(Hdwf, *mut c_int, *mut c_int) -> c_int,
    in_channel_enable_set: unsafe extern "C" fn(Hdwf, c_int, c_int) -> c_int,
    in_channel_range_set: unsafe extern "C" fn(Hdwf, c_int, c_double) -> c_int,
    in_channel_range_get: unsafe extern "C" fn(Hdwf, c_int, *mut c_double) -> c_int,
    in_channel_range_info:
        unsafe extern "C" fn(Hdwf, *mut c_double, *mut c_double, *mut c_double) -> c_int,
    in_channel_offset_set: unsafe extern "C" fn(Hdwf, c_int, c_double) -> c_int,
    in_channel_offset_get: unsafe extern "C" fn(Hdwf, c_int, *mut c_double) -> c_int,
    in_channel_offset_info:
        unsafe extern "C" fn(Hdwf, *mut c_double, *mut c_double, *mut c_double) -> c_int,
    in_channel_attenuation_get: unsafe extern "C" fn(Hdwf, c_int, *mut c_double) -> c_int,

    in_trigger_auto_timeout_set: unsafe extern "C" fn(Hdwf, c_double) -> c_int,
    in_trigger_auto_timeout_get: unsafe extern "C" fn(Hdwf, *mut c_double) -> c_int,
    in_trigger_auto_timeout_info:
        unsafe extern "C" fn(Hdwf, *mut c_double, *mut c_double, *mut c_double) -> c_int,
    in_trigger_source_set: unsafe extern "C" fn(Hdwf, c_uchar) -> c_int,
    in_trigger_type_set: unsafe extern "C" fn(Hdwf, c_int) -> c_int,
    in_trigger_channel_set: unsafe extern "C" fn(Hdwf, c_int) -> c_int,
    in_trigger_level_set: unsafe extern "C" fn(Hdwf, c_double) -> c_int,
    in_trigger_condition_set: unsafe extern "C" fn(Hdwf, c_int) -> c_int,
    in_trigger_hold_off_set: unsafe extern "C" fn(Hdwf, c_double) -> c_int,
    in_trigger_hold_off_get: unsafe extern "C" fn(Hdwf, *mut c_double) -> c_int,
    in_trigger_hold_off_info:
        unsafe extern "C" fn(Hdwf, *mut c_double, *mut c_double, *mut c_double) -> c_int,
    in_trigger_position_set: unsafe extern "C" fn(Hdwf, c_double) -> c_int,
    in_trigger_position_get: unsafe extern "C" fn(Hdwf, *mut c_double) -> c_int,
    in_trigger_position_info:
        unsafe extern "C" fn(Hdwf, *mut c_double, *mut c_double, *mut c_double) -> c_int,
    in_trigger_filter_set: unsafe extern "C" fn(Hdwf, c_int) -> c_int,

    in_configure: unsafe extern "C" fn(Hdwf, c_int, c_int) -> c_int,
    in_status: unsafe extern "C" fn(Hdwf, c_int, *mut c_uchar) -> c_int,
    in_status_data16: unsafe extern "C" fn(Hdwf, c_int, *mut c_short, c_int, c_int) -> c_int,
    in_status_record: unsafe extern "C" fn(Hdwf, *mut c_int, *mut c_int, *mut c_int) -> c_int,
    in_status_time: unsafe extern "C" fn(Hdwf, *mut c_uint, *mut c_uint, *mut c_uint) -> c_int,
}

impl DwfApi {
    fn load() -> Result<Self> {
        let lib = unsafe { Library::new(DWF_LIBRARY) }
            .with_context(|| format!("{DWF_LIBRARY} not found; is the WaveForms SDK installed?"))?;
        // Safety: signatures follow dwf.h from the WaveForms SDK.
        unsafe {
            Ok(Self {
                get_last_error_msg: *lib.get(b"FDwfGetLastErrorMsg\0")?,
                get_version: *lib.get(b"FDwfGetVersion\0")?,
                param_set: *lib.get(b"FDwfParamSet\0")?,
                enumerate: *lib.get(b"FDwfEnum\0")?,
                device_open: *lib.get(b"FDwfDeviceOpen\0")?,
                device_close: *lib.get(b"FDwfDeviceClose\0")?,
                device_auto_configure_set: *lib.get(b"FDwfDeviceAutoConfigureSet\0")?,

                out_node_enable_set: *lib.get(b"FDwfAnalogOutNodeEnableSet\0")?,
                out_idle_set: *lib.get(b"FDwfAnalogOutIdleSet\0")?,
                out_node_function_set: *lib.get(b"FDwfAnalogOutNodeFunctionSet\0")?,
                out_node_frequency_set: *lib.get(b"FDwfAnalogOutNodeFrequencySet\0")?,
                out_node_amplitude_set: *lib.get(b"FDwfAnalogOutNodeAmplitudeSet\0")?,
                out_node_offset_set: *lib.get(b"FDwfAnalogOutNodeOffsetSet\0")?,
                out_node_data_set: *lib.get(b"FDwfAnalogOutNodeDataSet\0")?,
                out_run_set: *lib.get(b"FDwfAnalogOutRunSet\0")?,
                out_wait_set: *lib.get(b"FDwfAnalogOutWaitSet\0")?,
                out_repeat_set: *lib.get(b"FDwfAnalogOutRepeatSet\0")?,
                out_configure: *lib.get(b"FDwfAnalogOutConfigure\0")?,

                in_channel_count: *lib.get(b"FDwfAnalogInChannelCount\0")?,
                in_frequency_set: *lib.get(b"FDwfAnalogInFrequencySet\0")?,
                in_buffer_size_set: *lib.get(b"FDwfAnalogInBufferSizeSet\0")?,
                in_buffer_size_info: *lib.get(b"FDwfAnalogInBufferSizeInfo\0")?,
                in_channel_enable_set: *lib.get(b"FDwfAnalogInChannelEnableSet\0")?,
                in_channel_range_set: *lib.get(b"FDwfAnalogInChannelRangeSet\0")?,
                in_channel_range_get: *lib.get(b"FDwfAnalogInChannelRangeGet\0")?,
                in_channel_range_info: *lib.get(b"FDwfAnalogInChannelRangeInfo\0")?,
                in_channel_offset_set: *lib.get(b"FDwfAnalogInChannelOffsetSet\0")?,
                in_channel_offset_get: *lib.get(b"FDwfAnalogInChannelOffsetGet\0")?,
                in_channel_offset_info: *lib.get(b"FDwfAnalogInChannelOffsetInfo\0")?,
                in_channel_attenuation_get: *lib.get(b"FDwfAnalogInChannelAttenuationGet\0")?,

                in_trigger_auto_timeout_set: *lib.get(b"FDwfAnalogInTriggerAutoTimeoutSet\0")?,
                in_trigger_auto_timeout_get: *lib.get(b"FDwfAnalogInTriggerAutoTimeoutGet\0")?,
                in_trigger_auto_timeout_info: *lib
                    .get(b"FDwfAnalogInTriggerAutoTimeoutInfo\0")?,
                in_trigger_source_set: *lib.get(b"FDwfAnalogInTriggerSourceSet\0")?,
                in_trigger_type_set: *lib.get(b"FDwfAnalogInTriggerTypeSet\0")?,
                in_trigger_channel_set: *lib.get(b"FDwfAnalogInTriggerChannelSet\0")?,
                in_trigger_level_set: *lib.get(b"FDwfAnalogInTriggerLevelSet\0")?,
                in_trigger_condition_set: *lib.get(b"FDwfAnalogInTriggerConditionSet\0")?,
                in_trigger_hold_off_set: *lib.get(b"FDwfAnalogInTriggerHoldOffSet\0")?,
                in_trigger_hold_off_get: *lib.get(b"FDwfAnalogInTriggerHoldOffGet\0")?,
                in_trigger_hold_off_info: *lib.get(b"FDwfAnalogInTriggerHoldOffInfo\0")?,
                in_trigger_position_set: *lib.get(b"FDwfAnalogInTriggerPositionSet\0")?,
                in_trigger_position_get: *lib.get(b"FDwfAnalogInTriggerPositionGet\0")?,
                in_trigger_position_info: *lib.get(b"FDwfAnalogInTriggerPositionInfo\0")?,
                in_trigger_filter_set: *lib.get(b"FDwfAnalogInTriggerFilterSet\0")?,

                in_configure: *lib.get(b"FDwfAnalogInConfigure\0")?,
                in_status: *lib.get(b"FDwfAnalogInStatus\0")?,
                in_status_data16: *lib.get(b"FDwfAnalogInStatusData16\0")?,
                in_status_record: *lib.get(b"FDwfAnalogInStatusRecord\0")?,
                in_status_time: *lib.get(b"FDwfAnalogInStatusTime\0")?,
                lib,
            })
        }
    }

    fn instance() -> Result<&'static DwfApi> {
        static API: OnceCell<DwfApi> = OnceCell::new();
        API.get_or_try_init(Self::load)
    }

    fn last_error(&self) -> String {
        let mut buf = [0 as c_char; 512];
        unsafe {
            (self.get_last_error_msg)(buf.as_mut_ptr());
            CStr::from_ptr(buf.as_ptr()).to_string_lossy().trim().to_string()
        }
    }

    fn version(&self) -> String {
        let mut buf = [0 as c_char; 32];
        unsafe {
            (self.get_version)(buf.as_mut_ptr());
            CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
        }
    }
}

/// SDK version string and number of attached devices.
pub fn probe() -> Result<(String, usize)> {
    let api = DwfApi::instance()?;
    let mut count: c_int = 0;
    unsafe { (api.enumerate)(ENUM_ALL, &mut count) };
    Ok((api.version(), count.max(0) as usize))
}

/// One open Analog Discovery handle.
///
/// Failed SDK calls are always logged. They only become errors when the
/// device was opened with `strict`; otherwise getters keep their NaN
/// defaults and the run carries on.
pub struct DwfDevice {
    api: &'static DwfApi,
    hdwf: Hdwf,
    strict: bool,
    channels: usize,
    closed: bool,
}

impl DwfDevice {
    /// Opens device `index`, or the first one found when `None`.
    pub fn open(index: Option<usize>, strict: bool) -> Result<Self> {
        let api = DwfApi::instance()?;
        info!("DWF version: {}", api.version());
        // keep the wavegen state as configured when the handle is closed
        unsafe { (api.param_set)(PARAM_ON_CLOSE, ON_CLOSE_RUN) };

        let mut hdwf: Hdwf = HDWF_NONE;
        let idx = index.map(|i| i as c_int).unwrap_or(-1);
        unsafe { (api.device_open)(idx, &mut hdwf) };
        if hdwf == HDWF_NONE {
            let message = api.last_error();
            error!("failed to open device: {message}");
            return Err(LabError::DeviceNotFound(message).into());
        }

        let mut device = Self {
            api,
            hdwf,
            strict,
            channels: 0,
            closed: false,
        };
        // settings are applied on Configure calls only
        let ok = unsafe { (api.device_auto_configure_set)(hdwf, 0) };
        device.check(ok, "FDwfDeviceAutoConfigureSet")?;
        let mut count: c_int = 0;
        let ok = unsafe { (api.in_channel_count)(hdwf, &mut count) };
        device.check(ok, "FDwfAnalogInChannelCount")?;
        device.channels = count.max(0) as usize;
        info!("opened device {hdwf} with {} analog inputs", device.channels);
        Ok(device)
    }

    fn check(&self, ok: c_int, context: &str) -> Result<(), LabError> {
        if ok != 0 {
            return Ok(());
        }
        let message = self.api.last_error();
        error!("DWF error in {context}: {message}");
        if self.strict {
            return Err(LabError::Instrument {
                context: context.to_string(),
                message,
            });
        }
        Ok(())
    }

    fn ensure_open(&self, context: &str) -> Result<(), LabError> {
        if self.closed {
            return Err(LabError::Instrument {
                context: context.to_string(),
                message: "device is closed".into(),
            });
        }
        Ok(())
    }

    fn channel_index(&self, channel: usize) -> Result<c_int, LabError> {
        if channel >= self.channels {
            return Err(LabError::ChannelOutOfRange {
                channel,
                available: self.channels,
            });
        }
        Ok(channel as c_int)
    }

    fn get_f64(
        &self,
        f: unsafe extern "C" fn(Hdwf, *mut c_double) -> c_int,
        context: &str,
    ) -> Result<f64, LabError> {
        let mut value: c_double = f64::NAN;
        let ok = unsafe { f(self.hdwf, &mut value) };
        self.check(ok, context)?;
        Ok(value)
    }

    fn get_channel_f64(
        &self,
        f: unsafe extern "C" fn(Hdwf, c_int, *mut c_double) -> c_int,
        channel: usize,
        context: &str,
    ) -> Result<f64, LabError> {
        let mut value: c_double = f64::NAN;
        let ok = unsafe { f(self.hdwf, channel as c_int, &mut value) };
        self.check(ok, context)?;
        Ok(value)
    }

    fn get_span(
        &self,
        f: unsafe extern "C" fn(Hdwf, *mut c_double, *mut c_double, *mut c_double) -> c_int,
        context: &str,
    ) -> Result<Span, LabError> {
        let (mut min, mut max, mut steps) = (f64::NAN, f64::NAN, f64::NAN);
        let ok = unsafe { f(self.hdwf, &mut min, &mut max, &mut steps) };
        self.check(ok, context)?;
        Ok(Span { min, max, steps })
    }
}

fn custom_sine_table() -> Vec<f64> {
    (0..CUSTOM_TABLE_LEN)
        .map(|i| (2.0 * std::f64::consts::PI * i as f64 / CUSTOM_TABLE_LEN as f64).sin())
        .collect()
}

fn slope_code(slope: TriggerSlope) -> c_int {
    match slope {
        TriggerSlope::Rise => 0,
        TriggerSlope::Fall => 1,
        TriggerSlope::Either => 2,
    }
}

fn filter_code(filter: TriggerFilter) -> c_int {
    match filter {
        TriggerFilter::Decimate => 0,
        TriggerFilter::Average => 1,
    }
}

impl Instrument for DwfDevice {
    fn channel_count(&self) -> usize {
        self.channels
    }

    fn configure_wavegen(&mut self, pulse: &PulseConfig, repeat: usize) -> Result<(), LabError> {
        self.ensure_open("configure_wavegen")?;
        let (api, h, ch) = (self.api, self.hdwf, pulse.channel as c_int);
        unsafe {
            self.check((api.out_node_enable_set)(h, ch, NODE_CARRIER, 1), "FDwfAnalogOutNodeEnableSet")?;
            self.check((api.out_idle_set)(h, ch, IDLE_OFFSET), "FDwfAnalogOutIdleSet")?;
            match pulse.function {
                WaveFunction::Square => self.check(
                    (api.out_node_function_set)(h, ch, NODE_CARRIER, FUNC_SQUARE),
                    "FDwfAnalogOutNodeFunctionSet",
                )?,
                WaveFunction::Sine => self.check(
                    (api.out_node_function_set)(h, ch, NODE_CARRIER, FUNC_SINE),
                    "FDwfAnalogOutNodeFunctionSet",
                )?,
                WaveFunction::CustomSine => {
                    self.check(
                        (api.out_node_function_set)(h, ch, NODE_CARRIER, FUNC_CUSTOM),
                        "FDwfAnalogOutNodeFunctionSet",
                    )?;
                    let table = custom_sine_table();
                    self.check(
                        (api.out_node_data_set)(h, ch, NODE_CARRIER, table.as_ptr(), table.len() as c_int),
                        "FDwfAnalogOutNodeDataSet",
                    )?;
                }
            }
            self.check(
                (api.out_node_frequency_set)(h, ch, NODE_CARRIER, pulse.frequency_hz),
                "FDwfAnalogOutNodeFrequencySet",
            )?;
            self.check(
                (api.out_node_amplitude_set)(h, ch, NODE_CARRIER, pulse.amplitude_v),
                "FDwfAnalogOutNodeAmplitudeSet",
            )?;
            self.check(
                (api.out_node_offset_set)(h, ch, NODE_CARRIER, pulse.offset_v),
                "FDwfAnalogOutNodeOffsetSet",
            )?;
            self.check((api.out_run_set)(h, ch, pulse.width_s), "FDwfAnalogOutRunSet")?;
            self.check((api.out_wait_set)(h, ch, pulse.repetition_s), "FDwfAnalogOutWaitSet")?;
            self.check((api.out_repeat_set)(h, ch, repeat as c_int), "FDwfAnalogOutRepeatSet")?;
        }
        debug!(
            "wavegen ch{}: {:?} {} V, run {:e} s, wait {:e} s, x{}",
            pulse.channel + 1,
            pulse.function,
            pulse.amplitude_v,
            pulse.width_s,
            pulse.repetition_s,
            repeat
        );
        Ok(())
    }

    fn start_wavegen(&mut self, channel: usize) -> Result<(), LabError> {
        self.ensure_open("start_wavegen")?;
        let ok = unsafe { (self.api.out_configure)(self.hdwf, channel as c_int, 1) };
        self.check(ok, "FDwfAnalogOutConfigure")
    }

    fn stop_wavegen(&mut self, channel: usize) -> Result<(), LabError> {
        self.ensure_open("stop_wavegen")?;
        let ok = unsafe { (self.api.out_configure)(self.hdwf, channel as c_int, 0) };
        self.check(ok, "FDwfAnalogOutConfigure")
    }

    fn configure_analog_in(&mut self, config: &AcquisitionConfig) -> Result<(), LabError> {
        self.ensure_open("configure_analog_in")?;
        let (api, h) = (self.api, self.hdwf);
        unsafe {
            self.check((api.in_frequency_set)(h, config.sample_rate_hz), "FDwfAnalogInFrequencySet")?;
            self.check(
                (api.in_buffer_size_set)(h, config.window_len() as c_int),
                "FDwfAnalogInBufferSizeSet",
            )?;
        }
        for (idx, ch) in config.channels.iter().enumerate() {
            let c = self.channel_index(idx)?;
            unsafe {
                self.check(
                    (api.in_channel_enable_set)(h, c, c_int::from(ch.enabled)),
                    "FDwfAnalogInChannelEnableSet",
                )?;
                self.check((api.in_channel_range_set)(h, c, ch.range_v), "FDwfAnalogInChannelRangeSet")?;
                self.check((api.in_channel_offset_set)(h, c, ch.offset_v), "FDwfAnalogInChannelOffsetSet")?;
            }
        }
        Ok(())
    }

    fn configure_trigger(
        &mut self,
        trigger: &TriggerConfig,
        position_s: Option<f64>,
    ) -> Result<(), LabError> {
        self.ensure_open("configure_trigger")?;
        let (api, h) = (self.api, self.hdwf);
        let source = match trigger.source {
            TriggerSource::AnalogIn => TRIGSRC_DETECTOR_ANALOG_IN,
            TriggerSource::External1 => TRIGSRC_EXTERNAL1,
        };
        unsafe {
            self.check(
                (api.in_trigger_auto_timeout_set)(h, trigger.auto_timeout_s),
                "FDwfAnalogInTriggerAutoTimeoutSet",
            )?;
            self.check((api.in_trigger_source_set)(h, source), "FDwfAnalogInTriggerSourceSet")?;
            self.check((api.in_trigger_type_set)(h, TRIGTYPE_EDGE), "FDwfAnalogInTriggerTypeSet")?;
            if trigger.source == TriggerSource::AnalogIn {
                let c = self.channel_index(trigger.channel)?;
                self.check((api.in_trigger_channel_set)(h, c), "FDwfAnalogInTriggerChannelSet")?;
            }
            self.check((api.in_trigger_level_set)(h, trigger.level_v), "FDwfAnalogInTriggerLevelSet")?;
            self.check(
                (api.in_trigger_condition_set)(h, slope_code(trigger.slope)),
                "FDwfAnalogInTriggerConditionSet",
            )?;
            self.check(
                (api.in_trigger_hold_off_set)(h, trigger.holdoff_s),
                "FDwfAnalogInTriggerHoldOffSet",
            )?;
            self.check(
                (api.in_trigger_filter_set)(h, filter_code(trigger.filter)),
                "FDwfAnalogInTriggerFilterSet",
            )?;
            if let Some(position) = position_s {
                self.check(
                    (api.in_trigger_position_set)(h, position),
                    "FDwfAnalogInTriggerPositionSet",
                )?;
            }
        }
        Ok(())
    }

    fn start_acquisition(&mut self) -> Result<(), LabError> {
        self.ensure_open("start_acquisition")?;
        let ok = unsafe { (self.api.in_configure)(self.hdwf, 0, 1) };
        self.check(ok, "FDwfAnalogInConfigure")
    }

    fn stop_acquisition(&mut self) -> Result<(), LabError> {
        self.ensure_open("stop_acquisition")?;
        let ok = unsafe { (self.api.in_configure)(self.hdwf, 0, 0) };
        self.check(ok, "FDwfAnalogInConfigure")
    }

    fn status(&mut self) -> Result<InstrumentStatus, LabError> {
        self.ensure_open("status")?;
        let mut code: c_uchar = 0;
        let ok = unsafe { (self.api.in_status)(self.hdwf, 1, &mut code) };
        self.check(ok, "FDwfAnalogInStatus")?;
        InstrumentStatus::from_raw(code).ok_or_else(|| LabError::Instrument {
            context: "FDwfAnalogInStatus".into(),
            message: format!("unknown state {code}"),
        })
    }

    fn read_window(&mut self, channel: usize, dest: &mut [i16]) -> Result<(), LabError> {
        self.ensure_open("read_window")?;
        let c = self.channel_index(channel)?;
        let ok = unsafe {
            (self.api.in_status_data16)(self.hdwf, c, dest.as_mut_ptr(), 0, dest.len() as c_int)
        };
        self.check(ok, "FDwfAnalogInStatusData16")
    }

    fn sample_loss(&mut self) -> Result<SampleLoss, LabError> {
        self.ensure_open("sample_loss")?;
        let (mut available, mut lost, mut corrupted): (c_int, c_int, c_int) = (0, 0, 0);
        let ok = unsafe {
            (self.api.in_status_record)(self.hdwf, &mut available, &mut lost, &mut corrupted)
        };
        self.check(ok, "FDwfAnalogInStatusRecord")?;
        Ok(SampleLoss {
            lost: lost.max(0) as u64,
            corrupted: corrupted.max(0) as u64,
        })
    }

    fn trigger_time(&mut self) -> Result<TriggerTime, LabError> {
        self.ensure_open("trigger_time")?;
        let mut time = TriggerTime::default();
        let ok = unsafe {
            (self.api.in_status_time)(
                self.hdwf,
                &mut time.trig_utc_sec,
                &mut time.trig_ticks,
                &mut time.ticks_per_sec,
            )
        };
        self.check(ok, "FDwfAnalogInStatusTime")?;
        Ok(time)
    }

    fn voltage_scale(&mut self, channel: usize) -> Result<VoltageScale, LabError> {
        self.ensure_open("voltage_scale")?;
        self.channel_index(channel)?;
        let range = self.get_channel_f64(
            self.api.in_channel_range_get,
            channel,
            "FDwfAnalogInChannelRangeGet",
        )?;
        let offset = self.get_channel_f64(
            self.api.in_channel_offset_get,
            channel,
            "FDwfAnalogInChannelOffsetGet",
        )?;
        debug!("ch{} conversion range {range} V, offset {offset} V", channel + 1);
        Ok(VoltageScale::new(range, offset))
    }

    fn scope_params(&mut self) -> Result<ScopeParams, LabError> {
        self.ensure_open("scope_params")?;
        let mut params = ScopeParams::default();
        for ch in 0..self.channels.min(2) {
            let scale = self.voltage_scale(ch)?;
            params.set_scale(ch, scale);
            let attenuation = self.get_channel_f64(
                self.api.in_channel_attenuation_get,
                ch,
                "FDwfAnalogInChannelAttenuationGet",
            )?;
            if ch == 0 {
                params.ch1_attenuation = attenuation;
            } else {
                params.ch2_attenuation = attenuation;
            }
        }
        params.trigger_pos =
            self.get_f64(self.api.in_trigger_position_get, "FDwfAnalogInTriggerPositionGet")?;
        params.trigger_holdoff_time =
            self.get_f64(self.api.in_trigger_hold_off_get, "FDwfAnalogInTriggerHoldOffGet")?;
        params.trigger_timeout = self.get_f64(
            self.api.in_trigger_auto_timeout_get,
            "FDwfAnalogInTriggerAutoTimeoutGet",
        )?;
        Ok(params)
    }

    fn capabilities(&mut self) -> Result<ScopeCapabilities, LabError> {
        self.ensure_open("capabilities")?;
        let (mut min, mut max): (c_int, c_int) = (0, 0);
        let ok = unsafe { (self.api.in_buffer_size_info)(self.hdwf, &mut min, &mut max) };
        self.check(ok, "FDwfAnalogInBufferSizeInfo")?;
        Ok(ScopeCapabilities {
            voltage_range: self.get_span(self.api.in_channel_range_info, "FDwfAnalogInChannelRangeInfo")?,
            voltage_offset: self
                .get_span(self.api.in_channel_offset_info, "FDwfAnalogInChannelOffsetInfo")?,
            trigger_position: self
                .get_span(self.api.in_trigger_position_info, "FDwfAnalogInTriggerPositionInfo")?,
            trigger_holdoff: self
                .get_span(self.api.in_trigger_hold_off_info, "FDwfAnalogInTriggerHoldOffInfo")?,
            trigger_timeout: self.get_span(
                self.api.in_trigger_auto_timeout_info,
                "FDwfAnalogInTriggerAutoTimeoutInfo",
            )?,
            buffer_size_min: min.max(0) as usize,
            buffer_size_max: max.max(0) as usize,
        })
    }

    fn close(&mut self) -> Result<(), LabError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // channel -1 addresses every wavegen channel
        let ok = unsafe { (self.api.out_configure)(self.hdwf, -1, 0) };
        if ok == 0 {
            warn!("failed to stop wavegen on close: {}", self.api.last_error());
        }
        let ok = unsafe { (self.api.in_configure)(self.hdwf, 0, 0) };
        if ok == 0 {
            warn!("failed to stop acquisition on close: {}", self.api.last_error());
        }
        let ok = unsafe { (self.api.device_close)(self.hdwf) };
        info!("closed device {}", self.hdwf);
        self.check(ok, "FDwfDeviceClose")
    }
}

impl Drop for DwfDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
