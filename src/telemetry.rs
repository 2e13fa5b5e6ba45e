use chrono::{NaiveDateTime, Timelike};
use serde::Deserialize;
use thiserror::Error;

/// Layout of the `Timestamp` field, e.g. `2024-01-01 12:00:00`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One decoded inverter status report. Built once per inbound message and
/// handed to the store by value.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub device: String,
    pub timestamp: NaiveDateTime,
    pub pro_ver: i64,
    pub minor_ver: i64,
    pub sn: i64,
    pub model: String,
    pub status: InverterStatus,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InverterStatus {
    pub tyield: f64,
    pub dyield: f64,
    pub pf: f64,
    pub pmax: f64,
    pub pac: i64,
    pub sac: f64,
    pub uab: f64,
    pub ubc: f64,
    pub uca: f64,
    pub ia: f64,
    pub ib: f64,
    pub ic: f64,
    pub freq: f64,
    pub tmod: f64,
    pub tamb: f64,
    pub mode: String,
    pub qac: i64,
    pub bus_capacitance: f64,
    pub ac_capacitance: f64,
    pub pdc: f64,
    pub pmax_lim: f64,
    pub smax_lim: f64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("timestamp {0:?} does not match YYYY-MM-DD hh:mm:ss")]
    BadTimestamp(String),
}

impl DecodeError {
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::Malformed(_) => "malformed",
            DecodeError::BadTimestamp(_) => "bad_timestamp",
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireReading<'a> {
    #[serde(rename = "Device", default, borrow)]
    device: Option<&'a str>,
    #[serde(rename = "Timestamp", default, borrow)]
    timestamp: Option<&'a str>,
    #[serde(rename = "ProVer", default)]
    pro_ver: Option<i64>,
    #[serde(rename = "MinorVer", default)]
    minor_ver: Option<i64>,
    #[serde(rename = "SN", default)]
    sn: Option<i64>,
    #[serde(rename = "model", default, borrow)]
    model: Option<&'a str>,
    #[serde(rename = "Status", default, borrow)]
    status: Option<WireStatus<'a>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireStatus<'a> {
    #[serde(rename = "Tyield")]
    tyield: Option<f64>,
    #[serde(rename = "Dyield")]
    dyield: Option<f64>,
    #[serde(rename = "PF")]
    pf: Option<f64>,
    #[serde(rename = "Pmax")]
    pmax: Option<f64>,
    #[serde(rename = "Pac")]
    pac: Option<i64>,
    #[serde(rename = "Sac")]
    sac: Option<f64>,
    #[serde(rename = "Uab")]
    uab: Option<f64>,
    #[serde(rename = "Ubc")]
    ubc: Option<f64>,
    #[serde(rename = "Uca")]
    uca: Option<f64>,
    #[serde(rename = "Ia")]
    ia: Option<f64>,
    #[serde(rename = "Ib")]
    ib: Option<f64>,
    #[serde(rename = "Ic")]
    ic: Option<f64>,
    #[serde(rename = "Freq")]
    freq: Option<f64>,
    #[serde(rename = "Tmod")]
    tmod: Option<f64>,
    #[serde(rename = "Tamb")]
    tamb: Option<f64>,
    #[serde(rename = "Mode", borrow)]
    mode: Option<&'a str>,
    #[serde(rename = "Qac")]
    qac: Option<i64>,
    #[serde(rename = "BusCapacitance")]
    bus_capacitance: Option<f64>,
    #[serde(rename = "AcCapacitance")]
    ac_capacitance: Option<f64>,
    #[serde(rename = "Pdc")]
    pdc: Option<f64>,
    #[serde(rename = "PmaxLim")]
    pmax_lim: Option<f64>,
    #[serde(rename = "SmaxLim")]
    smax_lim: Option<f64>,
}

impl WireStatus<'_> {
    fn into_status(self) -> InverterStatus {
        InverterStatus {
            tyield: self.tyield.unwrap_or_default(),
            dyield: self.dyield.unwrap_or_default(),
            pf: self.pf.unwrap_or_default(),
            pmax: self.pmax.unwrap_or_default(),
            pac: self.pac.unwrap_or_default(),
            sac: self.sac.unwrap_or_default(),
            uab: self.uab.unwrap_or_default(),
            ubc: self.ubc.unwrap_or_default(),
            uca: self.uca.unwrap_or_default(),
            ia: self.ia.unwrap_or_default(),
            ib: self.ib.unwrap_or_default(),
            ic: self.ic.unwrap_or_default(),
            freq: self.freq.unwrap_or_default(),
            tmod: self.tmod.unwrap_or_default(),
            tamb: self.tamb.unwrap_or_default(),
            mode: self.mode.unwrap_or_default().to_string(),
            qac: self.qac.unwrap_or_default(),
            bus_capacitance: self.bus_capacitance.unwrap_or_default(),
            ac_capacitance: self.ac_capacitance.unwrap_or_default(),
            pdc: self.pdc.unwrap_or_default(),
            pmax_lim: self.pmax_lim.unwrap_or_default(),
            smax_lim: self.smax_lim.unwrap_or_default(),
        }
    }
}

/// Decodes one MQTT payload into a [`Reading`].
///
/// Unknown keys are ignored and absent (or `null`) fields fall back to zero
/// values, but `Timestamp` must be present and match [`TIMESTAMP_FORMAT`]
/// exactly.
pub fn decode_reading(payload: &[u8]) -> Result<Reading, DecodeError> {
    let first = payload
        .iter()
        .copied()
        .find(|byte| !byte.is_ascii_whitespace());
    if first != Some(b'{') {
        return Err(DecodeError::Malformed(
            "payload is not a JSON object".to_string(),
        ));
    }

    let mut buffer = payload.to_vec();
    let wire: WireReading = simd_json::from_slice(&mut buffer)
        .map_err(|err| DecodeError::Malformed(err.to_string()))?;

    let timestamp = parse_timestamp(wire.timestamp.unwrap_or_default())?;

    Ok(Reading {
        device: wire.device.unwrap_or_default().to_string(),
        timestamp,
        pro_ver: wire.pro_ver.unwrap_or_default(),
        minor_ver: wire.minor_ver.unwrap_or_default(),
        sn: wire.sn.unwrap_or_default(),
        model: wire.model.unwrap_or_default().to_string(),
        status: wire.status.unwrap_or_default().into_status(),
    })
}

pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime, DecodeError> {
    let bad = || DecodeError::BadTimestamp(raw.to_string());
    if !has_timestamp_shape(raw) {
        return Err(bad());
    }
    let parsed = NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT).map_err(|_| bad())?;
    // chrono folds `:60` into the nanosecond field.
    if parsed.nanosecond() >= 1_000_000_000 {
        return Err(bad());
    }
    Ok(parsed)
}

// chrono accepts single-digit fields and surrounding padding; the wire format does not.
fn has_timestamp_shape(raw: &str) -> bool {
    let bytes = raw.as_bytes();
    bytes.len() == 19
        && bytes.iter().enumerate().all(|(idx, byte)| match idx {
            4 | 7 => *byte == b'-',
            10 => *byte == b' ',
            13 | 16 => *byte == b':',
            _ => byte.is_ascii_digit(),
        })
}
