use rust_decimal::Decimal;
use std::fmt;

/// How the raw register words of a value are interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    I16,
    U16,
    I32,
    U32,
    /// IEEE 754 single precision spread over two registers.
    F32,
}

impl Encoding {
    /// Number of 16-bit registers the value occupies.
    pub fn size(&self) -> u16 {
        use Encoding::*;
        match self {
            I16 | U16 => 1,
            I32 | U32 | F32 => 2,
        }
    }

    pub fn type_name(&self) -> String {
        format!("{:?}", *self).to_lowercase()
    }
}

/// The physical quantity a register measures. Units, Home Assistant metadata and sanity bounds all hang off this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Quantity {
    Voltage,
    Current,
    Power,
    Frequency,
    Energy,
}

impl Quantity {
    pub fn unit(&self) -> &'static str {
        match self {
            Quantity::Voltage => "V",
            Quantity::Current => "A",
            Quantity::Power => "W",
            Quantity::Frequency => "Hz",
            Quantity::Energy => "kWh",
        }
    }

    pub fn device_class(&self) -> &'static str {
        match self {
            Quantity::Voltage => "voltage",
            Quantity::Current => "current",
            Quantity::Power => "power",
            Quantity::Frequency => "frequency",
            Quantity::Energy => "energy",
        }
    }

    pub fn state_class(&self) -> &'static str {
        match self {
            Quantity::Energy => "total_increasing",
            _ => "measurement",
        }
    }

    /// Whether a decoded value is physically believable for a residential three-phase meter. The meter occasionally
    /// answers with garbage right after power-up; those values are dropped rather than published.
    pub fn is_plausible(&self, value: Decimal) -> bool {
        let thousand = Decimal::from(1000);
        match self {
            Quantity::Voltage | Quantity::Current => value >= Decimal::ZERO && value <= thousand,
            Quantity::Frequency => value >= Decimal::from(40) && value <= Decimal::from(70),
            Quantity::Power => value.abs() <= Decimal::from(50_000),
            Quantity::Energy => value >= Decimal::ZERO,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RegisterSpec {
    pub name: String,
    pub address: u16,
    pub encoding: Encoding,
    /// Multiplier applied to the raw value after decoding
    pub scale: Decimal,
    pub quantity: Quantity,
    /// Low word first for 32-bit encodings
    pub swap_words: bool,
}

impl RegisterSpec {
    pub fn new<S: Into<String>>(
        name: S,
        address: u16,
        encoding: Encoding,
        scale: Decimal,
        quantity: Quantity,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            encoding,
            scale,
            quantity,
            swap_words: false,
        }
    }

    pub fn word_count(&self) -> u16 {
        self.encoding.size()
    }

    /// One past the last register covered. `u32` so that a value ending at 0xFFFF does not wrap.
    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.word_count())
    }

    pub fn unit(&self) -> &'static str {
        self.quantity.unit()
    }
}

impl fmt::Display for RegisterSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{:#06x}/{}",
            self.name,
            self.address,
            self.encoding.type_name()
        )
    }
}

/// Ordered set of registers polled each cycle. Order only influences how reads are batched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegisterMap(Vec<RegisterSpec>);

impl RegisterMap {
    pub fn new(specs: Vec<RegisterSpec>) -> Self {
        Self(specs)
    }

    /// The DTSU666 measurement registers. All of them are float32, high word first, already expressed in the unit
    /// multiplied by the inverse of `scale`.
    pub fn dtsu666() -> Self {
        use Encoding::F32;
        use Quantity::*;

        let deci = Decimal::new(1, 1);
        let centi = Decimal::new(1, 2);
        let milli = Decimal::new(1, 3);

        Self(vec![
            RegisterSpec::new("Voltage_A", 0x2006, F32, deci, Voltage),
            RegisterSpec::new("Voltage_B", 0x2008, F32, deci, Voltage),
            RegisterSpec::new("Voltage_C", 0x200A, F32, deci, Voltage),
            RegisterSpec::new("Current_A", 0x200C, F32, milli, Current),
            RegisterSpec::new("Current_B", 0x200E, F32, milli, Current),
            RegisterSpec::new("Current_C", 0x2010, F32, milli, Current),
            RegisterSpec::new("Power_Total", 0x2012, F32, deci, Power),
            RegisterSpec::new("Power_A", 0x2014, F32, deci, Power),
            RegisterSpec::new("Power_B", 0x2016, F32, deci, Power),
            RegisterSpec::new("Power_C", 0x2018, F32, deci, Power),
            RegisterSpec::new("Frequency", 0x2044, F32, centi, Frequency),
            RegisterSpec::new("Energy_Import", 0x401E, F32, Decimal::ONE, Energy),
            RegisterSpec::new("Energy_Export", 0x4028, F32, Decimal::ONE, Energy),
        ])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RegisterSpec> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&RegisterSpec> {
        self.0.iter().find(|spec| spec.name == name)
    }
}

impl From<Vec<RegisterSpec>> for RegisterMap {
    fn from(specs: Vec<RegisterSpec>) -> Self {
        Self::new(specs)
    }
}

impl<'a> IntoIterator for &'a RegisterMap {
    type Item = &'a RegisterSpec;
    type IntoIter = std::slice::Iter<'a, RegisterSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn dtsu666_map_covers_published_fields() {
    let map = RegisterMap::dtsu666();
    let names: Vec<&str> = map.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "Voltage_A",
            "Voltage_B",
            "Voltage_C",
            "Current_A",
            "Current_B",
            "Current_C",
            "Power_Total",
            "Power_A",
            "Power_B",
            "Power_C",
            "Frequency",
            "Energy_Import",
            "Energy_Export",
        ]
    );
}

#[test]
fn dtsu666_registers_do_not_overlap() {
    let map = RegisterMap::dtsu666();
    let mut spans: Vec<(u32, u32)> = map
        .iter()
        .map(|s| (u32::from(s.address), s.end()))
        .collect();
    spans.sort();
    for pair in spans.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
    }
}

#[test]
fn encoding_sizes() {
    assert_eq!(Encoding::I16.size(), 1);
    assert_eq!(Encoding::U16.size(), 1);
    assert_eq!(Encoding::I32.size(), 2);
    assert_eq!(Encoding::U32.size(), 2);
    assert_eq!(Encoding::F32.size(), 2);
    assert_eq!(Encoding::F32.type_name(), "f32");
}

#[test]
fn spec_end_does_not_wrap() {
    let spec = RegisterSpec::new("x", 0xFFFF, Encoding::U16, Decimal::ONE, Quantity::Power);
    assert_eq!(spec.end(), 0x1_0000);
}

#[test]
fn plausibility_bounds() {
    assert!(Quantity::Voltage.is_plausible(Decimal::new(2301, 1)));
    assert!(!Quantity::Voltage.is_plausible(Decimal::from(-1)));
    assert!(!Quantity::Current.is_plausible(Decimal::from(1001)));
    assert!(Quantity::Frequency.is_plausible(Decimal::new(4998, 2)));
    assert!(!Quantity::Frequency.is_plausible(Decimal::ZERO));
    assert!(Quantity::Power.is_plausible(Decimal::from(-4500)));
    assert!(!Quantity::Power.is_plausible(Decimal::from(-50_001)));
    assert!(Quantity::Energy.is_plausible(Decimal::new(123456, 2)));
    assert!(!Quantity::Energy.is_plausible(Decimal::from(-3)));
}

#[test]
fn lookup_by_name() {
    let map = RegisterMap::dtsu666();
    let spec = map.get("Frequency").unwrap();
    assert_eq!(spec.address, 0x2044);
    assert_eq!(spec.unit(), "Hz");
    assert_eq!(spec.to_string(), "Frequency@0x2044/f32");
    assert!(map.get("Nope").is_none());
}
