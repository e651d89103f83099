use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_aux::field_attributes::deserialize_number_from_string;
use std::{fmt, str::FromStr};

/// The four Modbus read functions, stored in configuration by function code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FunctionKind {
    /// Bit outputs, function code 01
    Coils,
    /// Bit inputs, function code 02
    DiscreteInputs,
    /// Read/write words, function code 03
    HoldingRegisters,
    /// Read-only words, function code 04
    InputRegisters,
}

impl FunctionKind {
    pub fn code(self) -> u8 {
        match self {
            FunctionKind::Coils => 1,
            FunctionKind::DiscreteInputs => 2,
            FunctionKind::HoldingRegisters => 3,
            FunctionKind::InputRegisters => 4,
        }
    }

    pub fn is_bit(self) -> bool {
        matches!(self, FunctionKind::Coils | FunctionKind::DiscreteInputs)
    }

    /// Largest block a single request may cover.
    pub fn max_quantity(self) -> u16 {
        if self.is_bit() {
            2000
        } else {
            125
        }
    }
}

impl TryFrom<u8> for FunctionKind {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(FunctionKind::Coils),
            2 => Ok(FunctionKind::DiscreteInputs),
            3 => Ok(FunctionKind::HoldingRegisters),
            4 => Ok(FunctionKind::InputRegisters),
            other => Err(format!("unsupported read function code {other}")),
        }
    }
}

impl From<FunctionKind> for u8 {
    fn from(kind: FunctionKind) -> u8 {
        kind.code()
    }
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FunctionKind::Coils => "READ_COILS",
            FunctionKind::DiscreteInputs => "READ_DISCRETE_INPUTS",
            FunctionKind::HoldingRegisters => "READ_HOLDING_REGISTERS",
            FunctionKind::InputRegisters => "READ_INPUT_REGISTERS",
        };
        write!(f, "{} ({:02})", name, self.code())
    }
}

const REGISTER_PREFIX: &str = "register_";

/// Position of a read entry within its device. Reads are issued in ascending key order.
///
/// Written as `register_<n>` in the configuration store; a bare number is accepted too.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisterKey(pub u32);

impl FromStr for RegisterKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The top key is reserved so there is always room to append after the highest one.
        s.strip_prefix(REGISTER_PREFIX)
            .unwrap_or(s)
            .parse()
            .ok()
            .filter(|n| *n < u32::MAX)
            .map(RegisterKey)
            .ok_or_else(|| format!("invalid register key {s:?}"))
    }
}

impl fmt::Display for RegisterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", REGISTER_PREFIX, self.0)
    }
}

impl Serialize for RegisterKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RegisterKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// One contiguous block read: `quantity` values of `kind` starting at `address`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRead {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub address: u16,

    #[serde(
        default = "default_quantity",
        deserialize_with = "deserialize_number_from_string"
    )]
    pub quantity: u16,

    #[serde(rename = "function_code", alias = "function_kind")]
    pub kind: FunctionKind,

    #[serde(
        rename = "register_name",
        alias = "display_name",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
}

fn default_quantity() -> u16 {
    1
}

impl RegisterRead {
    pub fn new(kind: FunctionKind, address: u16, quantity: u16) -> Self {
        Self {
            address,
            quantity,
            kind,
            name: None,
        }
    }

    pub fn named<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into()).filter(|n: &String| !n.is_empty());
        self
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        let max = self.kind.max_quantity();
        if self.quantity == 0 || self.quantity > max {
            return Err(format!(
                "quantity {} is outside 1..={} for {}",
                self.quantity, max, self.kind
            ));
        }
        if u32::from(self.address) + u32::from(self.quantity) > u32::from(u16::MAX) + 1 {
            return Err(format!(
                "block of {} at {} runs past the end of the address space",
                self.quantity, self.address
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn parse_register_read_from_store() {
    use serde_json::json;
    let read = serde_json::from_value::<RegisterRead>(json!({
        "address": 40001,
        "register_name": "flow_rate",
        "function_code": 3,
        "quantity": "2",
        "units": "N/A",
        "gain": 1,
    }))
    .unwrap();

    assert_eq!(
        read,
        RegisterRead::new(FunctionKind::HoldingRegisters, 40001, 2).named("flow_rate")
    );
}

#[test]
fn parse_register_read_defaults_quantity() {
    use serde_json::json;
    let read = serde_json::from_value::<RegisterRead>(json!({
        "address": 7,
        "function_code": 1,
    }))
    .unwrap();

    assert_eq!(read.quantity, 1);
    assert_eq!(read.kind, FunctionKind::Coils);
    assert_eq!(read.name, None);
}

#[test]
fn reject_write_function_codes() {
    use serde_json::json;
    for code in [0, 5, 6, 15, 16] {
        let result = serde_json::from_value::<RegisterRead>(json!({
            "address": 7,
            "function_code": code,
        }));
        assert!(result.is_err(), "function code {code} should be rejected");
    }
}

#[test]
fn register_keys_order_numerically() {
    let mut keys: Vec<RegisterKey> = ["register_10", "register_2", "register_1", "3"]
        .iter()
        .map(|k| k.parse().unwrap())
        .collect();
    keys.sort();

    assert_eq!(
        keys,
        vec![RegisterKey(1), RegisterKey(2), RegisterKey(3), RegisterKey(10)]
    );
    assert_eq!(RegisterKey(10).to_string(), "register_10");
    assert!("register_x".parse::<RegisterKey>().is_err());
    assert!("register_4294967295".parse::<RegisterKey>().is_err());
    assert_eq!(
        "register_4294967294".parse::<RegisterKey>(),
        Ok(RegisterKey(u32::MAX - 1))
    );
}

#[test]
fn validate_quantity_limits() {
    assert!(RegisterRead::new(FunctionKind::InputRegisters, 0, 125)
        .validate()
        .is_ok());
    assert!(RegisterRead::new(FunctionKind::InputRegisters, 0, 126)
        .validate()
        .is_err());
    assert!(RegisterRead::new(FunctionKind::Coils, 0, 2000)
        .validate()
        .is_ok());
    assert!(RegisterRead::new(FunctionKind::Coils, 0, 0)
        .validate()
        .is_err());
    assert!(RegisterRead::new(FunctionKind::HoldingRegisters, u16::MAX, 2)
        .validate()
        .is_err());
}
