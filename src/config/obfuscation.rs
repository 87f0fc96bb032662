//! AmneziaWG obfuscation parameters
//!
//! Junk packet settings (`Jc`, `Jmin`, `Jmax`), handshake padding (`S1`-`S4`),
//! magic headers (`H1`-`H4`) and signature packets (`I1`-`I5`). Server and
//! client must carry identical values or the handshake never completes, so
//! these are only ever copied, never computed.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationParams {
    /// Junk packet count
    #[serde(default = "default_jc")]
    pub jc: u32,
    /// Junk packet minimum size
    #[serde(default = "default_jmin")]
    pub jmin: u32,
    /// Junk packet maximum size
    #[serde(default = "default_jmax")]
    pub jmax: u32,
    /// Init packet padding
    #[serde(default)]
    pub s1: u32,
    /// Response packet padding
    #[serde(default)]
    pub s2: u32,
    /// Cookie packet padding
    #[serde(default)]
    pub s3: u32,
    /// Transport packet padding
    #[serde(default)]
    pub s4: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h3: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i1: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i2: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i3: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub i5: Option<String>,
}

fn default_jc() -> u32 { 6 }
fn default_jmin() -> u32 { 50 }
fn default_jmax() -> u32 { 1000 }

impl Default for ObfuscationParams {
    fn default() -> Self {
        Self {
            jc: default_jc(),
            jmin: default_jmin(),
            jmax: default_jmax(),
            ..Self::disabled()
        }
    }
}

impl ObfuscationParams {
    /// All parameters off, which is what an interface file without any of
    /// the keys amounts to
    pub fn disabled() -> Self {
        Self {
            jc: 0,
            jmin: 0,
            jmax: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            h1: None,
            h2: None,
            h3: None,
            h4: None,
            i1: None,
            i2: None,
            i3: None,
            i4: None,
            i5: None,
        }
    }

    /// `Key = value` pairs in config file order; optional strings only when set
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            ("Jc", self.jc.to_string()),
            ("Jmin", self.jmin.to_string()),
            ("Jmax", self.jmax.to_string()),
            ("S1", self.s1.to_string()),
            ("S2", self.s2.to_string()),
            ("S3", self.s3.to_string()),
            ("S4", self.s4.to_string()),
        ];

        let optional = [
            ("H1", &self.h1),
            ("H2", &self.h2),
            ("H3", &self.h3),
            ("H4", &self.h4),
            ("I1", &self.i1),
            ("I2", &self.i2),
            ("I3", &self.i3),
            ("I4", &self.i4),
            ("I5", &self.i5),
        ];
        for (key, value) in optional {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                out.push((key, value.to_string()));
            }
        }
        out
    }

    /// Apply one config file key (case-insensitive)
    ///
    /// Returns `Ok(false)` when the key is not an obfuscation parameter.
    pub fn set(&mut self, key: &str, value: &str) -> Result<bool, String> {
        let number = |v: &str| {
            v.parse::<u32>()
                .map_err(|_| format!("{} must be a non-negative integer, got {}", key, v))
        };
        let text = |v: &str| Some(v.to_string()).filter(|s| !s.is_empty());

        match key.to_ascii_lowercase().as_str() {
            "jc" => self.jc = number(value)?,
            "jmin" => self.jmin = number(value)?,
            "jmax" => self.jmax = number(value)?,
            "s1" => self.s1 = number(value)?,
            "s2" => self.s2 = number(value)?,
            "s3" => self.s3 = number(value)?,
            "s4" => self.s4 = number(value)?,
            "h1" => self.h1 = text(value),
            "h2" => self.h2 = text(value),
            "h3" => self.h3 = text(value),
            "h4" => self.h4 = text(value),
            "i1" => self.i1 = text(value),
            "i2" => self.i2 = text(value),
            "i3" => self.i3 = text(value),
            "i4" => self.i4 = text(value),
            "i5" => self.i5 = text(value),
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.jmin > self.jmax {
            return Err(format!(
                "Jmin ({}) must not exceed Jmax ({})",
                self.jmin, self.jmax
            ));
        }
        Ok(())
    }
}
