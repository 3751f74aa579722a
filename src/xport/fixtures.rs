// src/xport/fixtures.rs

//! In-memory transport files for tests.

use super::header::{self, RECORD_LEN};
use super::{ibm, Value, VariableKind};

const STAMP: &str = "13APR89:10:20:06";

struct FixtureVar {
    name: String,
    label: Vec<u8>,
    kind: VariableKind,
    length: usize,
}

pub(crate) struct XportFixture {
    dataset: String,
    vars: Vec<FixtureVar>,
    rows: Vec<Vec<Value>>,
    namestr_len: usize,
    created: String,
}

fn padded(text: &[u8], width: usize) -> Vec<u8> {
    let mut out = text[..text.len().min(width)].to_vec();
    out.resize(width, b' ');
    out
}

fn pad_record(buf: &mut Vec<u8>) {
    let rem = buf.len() % RECORD_LEN;
    if rem != 0 {
        buf.resize(buf.len() + RECORD_LEN - rem, b' ');
    }
}

fn header_record(marker: &[u8], tail: &str) -> Vec<u8> {
    let mut rec = marker.to_vec();
    rec.extend_from_slice(tail.as_bytes());
    padded(&rec, RECORD_LEN)
}

impl XportFixture {
    pub(crate) fn new(dataset: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            vars: Vec::new(),
            rows: Vec::new(),
            namestr_len: 140,
            created: STAMP.to_string(),
        }
    }

    pub(crate) fn numeric(self, name: &str, label: &str) -> Self {
        self.numeric_width(name, label, 8)
    }

    pub(crate) fn numeric_width(mut self, name: &str, label: &str, width: usize) -> Self {
        self.vars.push(FixtureVar {
            name: name.to_string(),
            label: label.as_bytes().to_vec(),
            kind: VariableKind::Numeric,
            length: width,
        });
        self
    }

    pub(crate) fn character(mut self, name: &str, label: &str, length: usize) -> Self {
        self.vars.push(FixtureVar {
            name: name.to_string(),
            label: label.as_bytes().to_vec(),
            kind: VariableKind::Char,
            length,
        });
        self
    }

    pub(crate) fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }

    /// Overwrite a variable's label with raw (possibly non-UTF-8) bytes.
    pub(crate) fn label_bytes(mut self, name: &str, raw: &[u8]) -> Self {
        if let Some(var) = self.vars.iter_mut().find(|v| v.name == name) {
            var.label = raw.to_vec();
        }
        self
    }

    pub(crate) fn namestr_len(mut self, len: usize) -> Self {
        self.namestr_len = len;
        self
    }

    /// Raw 16-byte creation stamp of the library header.
    pub(crate) fn created(mut self, stamp: &str) -> Self {
        self.created = stamp.to_string();
        self
    }

    fn namestr(&self, index: usize, var: &FixtureVar, position: usize) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.namestr_len);
        let ntype: i16 = match var.kind {
            VariableKind::Numeric => 1,
            VariableKind::Char => 2,
        };
        raw.extend_from_slice(&ntype.to_be_bytes());
        raw.extend_from_slice(&0i16.to_be_bytes());
        raw.extend_from_slice(&(var.length as i16).to_be_bytes());
        raw.extend_from_slice(&((index + 1) as i16).to_be_bytes());
        raw.extend_from_slice(&padded(var.name.as_bytes(), 8));
        raw.extend_from_slice(&padded(&var.label, 40));
        raw.extend_from_slice(&padded(b"", 8));
        raw.extend_from_slice(&[0u8; 8]); // nfl, nfd, nfj, nfill
        raw.extend_from_slice(&padded(b"", 8));
        raw.extend_from_slice(&[0u8; 4]); // nifl, nifd
        raw.extend_from_slice(&(position as i32).to_be_bytes());
        raw.resize(self.namestr_len, 0);
        raw
    }

    fn cell(var: &FixtureVar, value: &Value) -> Vec<u8> {
        match var.kind {
            VariableKind::Numeric => {
                let full = match value {
                    Value::Missing => ibm::MISSING,
                    other => ibm::encode(other.as_f64().unwrap_or_default()),
                };
                full[..var.length].to_vec()
            }
            VariableKind::Char => {
                let text = match value {
                    Value::Missing => String::new(),
                    other => other.to_string(),
                };
                padded(text.as_bytes(), var.length)
            }
        }
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let zeros = "000000000000000000000000000000  ";

        // library header + real headers
        out.extend(header_record(header::LIBRARY, zeros));
        let mut real = header::SAS_LIBRARY_TAG.to_vec();
        real.extend_from_slice(b"9.4     X64_7PRO");
        let mut real = padded(&real, 64);
        real.extend_from_slice(&padded(self.created.as_bytes(), 16));
        out.extend(real);
        out.extend(padded(STAMP.as_bytes(), RECORD_LEN));

        // member + descriptor
        out.extend(header_record(
            header::MEMBER,
            &format!("00000000000000000160000000{:04}  ", self.namestr_len),
        ));
        out.extend(header_record(header::DESCRIPTOR, zeros));
        let mut member = header::SAS_MEMBER_TAG.to_vec();
        member.extend(padded(self.dataset.as_bytes(), 8));
        member.extend_from_slice(b"SASDATA 9.4     X64_7PRO");
        let mut member = padded(&member, 64);
        member.extend_from_slice(STAMP.as_bytes());
        out.extend(member);
        let mut second = padded(STAMP.as_bytes(), 32);
        second.extend(padded(b"FIXTURE", 40));
        out.extend(padded(&second, RECORD_LEN));

        // namestrs
        out.extend(header_record(
            header::NAMESTR,
            &format!("000000{:04}00000000000000000000  ", self.vars.len()),
        ));
        let mut position = 0;
        for (i, var) in self.vars.iter().enumerate() {
            out.extend(self.namestr(i, var, position));
            position += var.length;
        }
        pad_record(&mut out);

        // observations
        out.extend(header_record(header::OBS, zeros));
        for row in &self.rows {
            for (var, value) in self.vars.iter().zip(row) {
                out.extend(Self::cell(var, value));
            }
        }
        pad_record(&mut out);
        out
    }
}
