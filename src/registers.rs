//! Register catalogs of the heat pump controller and the block addressing scheme.
//!
//! Every device kind owns a range of absolute addresses starting at its base address. The
//! range is split into blocks of [`INSTANCE_STRIDE`] registers, one block per configured
//! instance, and a [`RegisterTemplate`] names one register by its offset within such a
//! block. The [`DeviceKind::General`] kind is the exception: it has a single instance and its
//! templates carry absolute addresses.

/// Width of the address block occupied by a single device instance.
pub const INSTANCE_STRIDE: u16 = 100;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
    clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DeviceKind {
    /// Ambient sensors and the energy manager.
    General,
    HeatPump,
    Boiler,
    Buffer,
    Solar,
    HeatingCircuit,
}

impl DeviceKind {
    /// Kinds which are instantiated per configured device, in address order.
    pub const INDEXED: [DeviceKind; 5] = [
        DeviceKind::HeatPump,
        DeviceKind::Boiler,
        DeviceKind::Buffer,
        DeviceKind::Solar,
        DeviceKind::HeatingCircuit,
    ];

    pub const fn base(self) -> u16 {
        match self {
            DeviceKind::General => 0,
            DeviceKind::HeatPump => 1000,
            DeviceKind::Boiler => 2000,
            DeviceKind::Buffer => 3000,
            DeviceKind::Solar => 4000,
            DeviceKind::HeatingCircuit => 5000,
        }
    }

    pub const fn max_instances(self) -> u8 {
        match self {
            DeviceKind::General => 1,
            DeviceKind::HeatPump => 3,
            DeviceKind::Boiler => 5,
            DeviceKind::Buffer => 5,
            DeviceKind::Solar => 2,
            DeviceKind::HeatingCircuit => 12,
        }
    }

    /// Prefix of the sensor ids generated for instances of this kind.
    ///
    /// `None` for kinds whose sensor ids are the bare template key.
    pub const fn prefix(self) -> Option<&'static str> {
        match self {
            DeviceKind::General => None,
            DeviceKind::HeatPump => Some("hp"),
            DeviceKind::Boiler => Some("boil"),
            DeviceKind::Buffer => Some("buff"),
            DeviceKind::Solar => Some("sol"),
            DeviceKind::HeatingCircuit => Some("hc"),
        }
    }

    pub const fn templates(self) -> &'static [RegisterTemplate] {
        match self {
            DeviceKind::General => GENERAL,
            DeviceKind::HeatPump => HEAT_PUMP,
            DeviceKind::Boiler => BOILER,
            DeviceKind::Buffer => BUFFER,
            DeviceKind::Solar => SOLAR,
            DeviceKind::HeatingCircuit => HEATING_CIRCUIT,
        }
    }

    pub fn template(self, key: &str) -> Option<&'static RegisterTemplate> {
        self.templates().iter().find(|t| t.key == key)
    }
}

/// Absolute address of the first register of the `index`th (1-based) instance of `kind`.
///
/// `index` must be within `1..=kind.max_instances()`.
pub const fn base_address(kind: DeviceKind, index: u8) -> u16 {
    kind.base() + (index as u16 - 1) * INSTANCE_STRIDE
}

pub const fn absolute(kind: DeviceKind, index: u8, offset: u16) -> u16 {
    base_address(kind, index) + offset
}

/// Logical sensor id of a template within the given instance.
pub fn sensor_id(
    kind: DeviceKind,
    index: u8,
    template: &RegisterTemplate,
    legacy_names: bool,
) -> String {
    let key = match template.legacy_key {
        Some(legacy) if legacy_names => legacy,
        _ => template.key,
    };
    match kind.prefix() {
        None => key.to_string(),
        Some(prefix) => format!("{prefix}{index}_{key}"),
    }
}

/// Find the instance and template whose register starts at `address`.
pub fn locate(address: u16) -> Option<(DeviceKind, u8, &'static RegisterTemplate)> {
    if let Some(template) = GENERAL.iter().find(|t| t.offset == address) {
        return Some((DeviceKind::General, 1, template));
    }
    let kind = DeviceKind::INDEXED.into_iter().rev().find(|k| address >= k.base())?;
    let relative = address - kind.base();
    let index = u8::try_from(relative / INSTANCE_STRIDE + 1).ok()?;
    if index > kind.max_instances() {
        return None;
    }
    let offset = relative % INSTANCE_STRIDE;
    let template = kind.templates().iter().find(|t| t.offset == offset)?;
    Some((kind, index, template))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    U16,
    I16,
    /// Two consecutive registers, high word first.
    I32,
}

impl DataType {
    pub const fn words(self) -> usize {
        match self {
            DataType::U16 | DataType::I16 => 1,
            DataType::I32 => 2,
        }
    }

    pub const fn is_signed(self) -> bool {
        !matches!(self, DataType::U16)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DataType::U16 => "u16",
            DataType::I16 => "i16",
            DataType::I32 => "i32",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterType {
    Holding,
    Input,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Mode(u8);

impl serde::Serialize for Mode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0 & Self::R.0 == 0 { "-" } else { "R" })?;
        f.write_str(if self.0 & Self::W.0 == 0 { "-" } else { "W" })?;
        Ok(())
    }
}

impl Mode {
    pub const R: Self = Self(1 << 0);
    pub const W: Self = Self(1 << 1);
    pub const RW: Self = Self(Self::R.0 | Self::W.0);
    const R_: Self = Self::R;

    pub const fn is_writeable(self) -> bool {
        self.0 & Self::W.0 != 0
    }
}

/// Code to label table of a state register.
pub type StateTable = &'static [(i64, &'static str)];

#[derive(Clone, Copy, Debug)]
pub struct RegisterTemplate {
    pub key: &'static str,
    pub name: &'static str,
    /// Offset within the instance block (absolute address for [`DeviceKind::General`]).
    pub offset: u16,
    pub data_type: DataType,
    pub register_type: RegisterType,
    pub mode: Mode,
    pub unit: Option<&'static str>,
    pub scale: f64,
    /// Decimal places retained after scaling.
    pub precision: u8,
    /// Lowest firmware compatibility tier which has this register.
    pub min_firmware: u8,
    pub states: Option<StateTable>,
    /// Key used in place of `key` when legacy naming is enabled.
    pub legacy_key: Option<&'static str>,
}

const fn t(
    offset: u16,
    data_type: DataType,
    mode: Mode,
    key: &'static str,
    name: &'static str,
) -> RegisterTemplate {
    RegisterTemplate {
        key,
        name,
        offset,
        data_type,
        register_type: RegisterType::Holding,
        mode,
        unit: None,
        scale: 1.0,
        precision: 0,
        min_firmware: 1,
        states: None,
        legacy_key: None,
    }
}

impl RegisterTemplate {
    const fn unit(self, unit: &'static str) -> Self {
        Self { unit: Some(unit), ..self }
    }

    const fn scaled(self, scale: f64, precision: u8) -> Self {
        Self { scale, precision, ..self }
    }

    /// Temperature in tenths of a degree.
    const fn deci_celsius(self) -> Self {
        self.unit("°C").scaled(0.1, 1)
    }

    /// Temperature in hundredths of a degree.
    const fn centi_celsius(self) -> Self {
        self.unit("°C").scaled(0.01, 2)
    }

    const fn states(self, states: StateTable) -> Self {
        Self { states: Some(states), ..self }
    }

    const fn since(self, min_firmware: u8) -> Self {
        Self { min_firmware, ..self }
    }

    const fn legacy(self, legacy_key: &'static str) -> Self {
        Self { legacy_key: Some(legacy_key), ..self }
    }

    pub fn state_label(&self, code: i64) -> Option<&'static str> {
        let states = self.states?;
        states.iter().find(|(c, _)| *c == code).map(|(_, label)| *label)
    }
}

use DataType::{I16, I32, U16};
const R_: Mode = Mode::R_;
const RW: Mode = Mode::RW;

const GENERAL_OPERATING_STATES: StateTable =
    &[(0, "OFF"), (1, "AUTOMATIK"), (2, "MANUAL"), (3, "ERROR"), (4, "OFFLINE")];

const HP_ERROR_STATES: StateTable =
    &[(0, "NONE"), (1, "MESSAGE"), (2, "WARNING"), (3, "ALARM"), (4, "FAULT")];

const HP_STATES: StateTable = &[
    (0, "INIT"),
    (1, "REFERENCE"),
    (2, "RESTART-BLOCK"),
    (3, "READY"),
    (4, "START PUMPS"),
    (5, "START COMPRESSOR"),
    (6, "PRE-REGULATION"),
    (7, "REGULATION"),
    (8, "NOT USED"),
    (9, "COOLING"),
    (10, "DEFROSTING"),
    (20, "STOPPING"),
    (30, "FAULT-LOCK"),
    (31, "ALARM-BLOCK"),
    (40, "ERROR-RESET"),
];

const HP_OPERATING_STATES: StateTable = &[
    (0, "STBY"),
    (1, "CH"),
    (2, "DHW"),
    (3, "CC"),
    (4, "CIRCULATE"),
    (5, "DEFROST"),
    (6, "OFF"),
    (7, "FROST"),
    (8, "STBY-FROST"),
    (9, "NOT USED"),
    (10, "SUMMER"),
    (11, "HOLIDAY"),
    (12, "ERROR"),
    (13, "WARNING"),
    (14, "INFO-MESSAGE"),
    (15, "TIME-BLOCK"),
    (16, "RELEASE-BLOCK"),
    (17, "MINTEMP-BLOCK"),
    (18, "FIRMWARE-DOWNLOAD"),
];

const REQUEST_TYPES: StateTable = &[
    (0, "NO REQUEST"),
    (1, "FLOW PUMP CIRCULATION"),
    (2, "CENTRAL HEATING"),
    (3, "CENTRAL COOLING"),
    (4, "DOMESTIC HOT WATER"),
];

const BOILER_OPERATING_STATES: StateTable = &[
    (0, "STBY"),
    (1, "DHW"),
    (2, "LEGIO"),
    (3, "SUMMER"),
    (4, "FROST"),
    (5, "HOLIDAY"),
    (6, "PRIO-STOP"),
    (7, "ERROR"),
    (8, "OFF"),
    (9, "PROMPT-DHW"),
    (10, "TRAILING-STOP"),
    (11, "TEMP-LOCK"),
    (12, "STBY-FROST"),
];

const ON_OFF: StateTable = &[(0, "OFF"), (1, "ON")];

const BUFFER_OPERATING_STATES: StateTable = &[
    (0, "STBY"),
    (1, "HEATING"),
    (2, "COOLING"),
    (3, "SUMMER"),
    (4, "FROST"),
    (5, "HOLIDAY"),
    (6, "PRIO-STOP"),
    (7, "ERROR"),
    (8, "OFF"),
    (9, "STBY-FROST"),
];

const SOLAR_OPERATING_STATES: StateTable =
    &[(0, "STBY"), (1, "HEATING"), (2, "ERROR"), (3, "OFF")];

const HC_OPERATING_STATES: StateTable = &[
    (0, "HEATING"),
    (1, "ECO"),
    (2, "COOLING"),
    (3, "FLOORDRY"),
    (4, "FROST"),
    (5, "MAX-TEMP"),
    (6, "ERROR"),
    (7, "SERVICE"),
    (8, "HOLIDAY"),
    (9, "CH-SUMMER"),
    (10, "CC-WINTER"),
    (11, "PRIO-STOP"),
    (12, "OFF"),
    (13, "RELEASE-OFF"),
    (14, "TIME-OFF"),
    (15, "STBY"),
    (16, "STBY-HEATING"),
    (17, "STBY-ECO"),
    (18, "STBY-COOLING"),
    (19, "STBY-FROST"),
    (20, "STBY-FLOORDRY"),
];

const HC_OPERATING_MODES: StateTable = &[
    (0, "OFF"),
    (1, "MANUAL"),
    (2, "AUTOMATIK"),
    (3, "AUTO-HEATING"),
    (4, "AUTO-COOLING"),
    (5, "FROST"),
    (6, "SUMMER"),
    (7, "FLOOR-DRY"),
];

pub const GENERAL: &[RegisterTemplate] = &[
    t(0, I16, R_, "ambient_error_number", "Ambient error number"),
    t(1, U16, R_, "ambient_operating_state", "Ambient operating state")
        .states(GENERAL_OPERATING_STATES),
    t(2, I16, RW, "ambient_temperature", "Actual ambient temperature").deci_celsius(),
    t(3, I16, R_, "ambient_temperature_1h", "Arithmetic average temperature of the last hour")
        .deci_celsius(),
    t(4, I16, R_, "ambient_temperature_calculated", "Calculated ambient temperature")
        .deci_celsius(),
    t(100, I16, R_, "emgr_error_number", "E-manager error number"),
    t(101, U16, R_, "emgr_operating_state", "E-manager operating state")
        .states(GENERAL_OPERATING_STATES),
    t(102, I16, RW, "emgr_actual_power", "E-manager actual power (PV surplus)")
        .unit("W")
        .legacy("pv_surplus_power"),
    t(103, I16, R_, "emgr_actual_power_consumption", "Actual power consumption of all heat pumps")
        .unit("W"),
    t(104, I16, R_, "emgr_power_consumption_setpoint", "Power consumption setpoint").unit("W"),
];

pub const HEAT_PUMP: &[RegisterTemplate] = &[
    t(0, U16, R_, "error_state", "Error state").states(HP_ERROR_STATES),
    t(1, I16, R_, "error_number", "Error number"),
    t(2, U16, R_, "state", "State").states(HP_STATES),
    t(3, U16, R_, "operating_state", "Operating state").states(HP_OPERATING_STATES),
    t(4, I16, R_, "flow_line_temperature", "Flow line temperature").centi_celsius(),
    t(5, I16, R_, "return_line_temperature", "Return line temperature").centi_celsius(),
    t(6, I16, R_, "volume_flow_heat_sink", "Volume flow heat sink").unit("l/h"),
    t(7, I16, R_, "energy_source_inlet_temperature", "Energy source inlet temperature")
        .centi_celsius()
        .legacy("source_inlet_temperature"),
    t(8, I16, R_, "energy_source_outlet_temperature", "Energy source outlet temperature")
        .centi_celsius()
        .legacy("source_outlet_temperature"),
    t(9, I16, R_, "volume_flow_energy_source", "Volume flow energy source")
        .unit("l/min")
        .scaled(0.01, 2),
    t(10, U16, R_, "compressor_unit_rating", "Compressor unit rating")
        .unit("%")
        .scaled(0.01, 2)
        .legacy("compressor_rating"),
    t(11, I16, R_, "actual_heating_capacity", "Actual heating capacity")
        .unit("kW")
        .scaled(0.1, 1),
    t(12, I16, R_, "inverter_actual_power_consumption", "Frequency inverter actual power")
        .unit("W"),
    t(13, I16, R_, "cop", "Coefficient of performance").scaled(0.01, 2),
    t(15, I16, RW, "request_type", "Request type").states(REQUEST_TYPES).since(2),
    t(16, I16, RW, "request_flow_line_temperature", "Requested flow line temperature")
        .deci_celsius()
        .since(2),
    t(17, I16, RW, "request_return_line_temperature", "Requested return line temperature")
        .deci_celsius()
        .since(2),
    t(18, I16, RW, "request_heat_sink_temperature_difference", "Requested heat sink spread")
        .unit("K")
        .scaled(0.1, 1)
        .since(2),
    t(19, I16, R_, "relais_state_2nd_heating_stage", "Relais state for 2nd heating stage")
        .states(ON_OFF),
    t(20, I32, R_, "compressor_power_consumption_accumulated", "Accumulated power consumption")
        .unit("Wh"),
    t(22, I32, R_, "compressor_thermal_energy_output_accumulated", "Accumulated energy output")
        .unit("Wh"),
    t(24, U16, R_, "vda_rating", "VdA rating").unit("%").scaled(0.01, 2).since(3),
    t(25, I16, R_, "hot_gas_temperature", "Hot gas temperature").centi_celsius().since(3),
    t(26, I16, R_, "subcooling_temperature", "Subcooling temperature").centi_celsius().since(3),
    t(27, I16, R_, "suction_gas_temperature", "Suction gas temperature").centi_celsius().since(3),
    t(28, I16, R_, "condensation_temperature", "Condensation temperature")
        .centi_celsius()
        .since(3),
    t(29, I16, R_, "evaporation_temperature", "Evaporation temperature").centi_celsius().since(3),
    t(30, I16, R_, "eqm_rating", "EqM rating").unit("%").scaled(0.01, 2).since(3),
    t(31, I16, R_, "expansion_valve_opening_angle", "Expansion valve opening angle")
        .unit("%")
        .scaled(0.01, 2)
        .since(3),
];

pub const BOILER: &[RegisterTemplate] = &[
    t(0, I16, R_, "error_number", "Error number"),
    t(1, U16, R_, "operating_state", "Operating state").states(BOILER_OPERATING_STATES),
    t(2, I16, R_, "actual_high_temperature", "Actual temperature at the top").deci_celsius(),
    t(3, I16, R_, "actual_low_temperature", "Actual temperature at the bottom").deci_celsius(),
    t(4, I16, R_, "actual_circulation_temperature", "Actual circulation temperature")
        .deci_celsius()
        .since(2),
    t(5, I16, R_, "actual_circulation_pump_state", "Circulation pump state")
        .states(ON_OFF)
        .since(2)
        .legacy("circulation_pump_state"),
    t(50, I16, RW, "target_high_temperature", "Maximum boiler temperature").deci_celsius(),
];

pub const BUFFER: &[RegisterTemplate] = &[
    t(0, I16, R_, "error_number", "Error number"),
    t(1, U16, R_, "operating_state", "Operating state").states(BUFFER_OPERATING_STATES),
    t(2, I16, R_, "actual_high_temperature", "Actual temperature at the top").deci_celsius(),
    t(3, I16, R_, "actual_low_temperature", "Actual temperature at the bottom").deci_celsius(),
    t(4, I16, RW, "modbus_buffer_temperature_high", "Buffer temperature set via Modbus")
        .deci_celsius()
        .since(2),
    t(5, I16, RW, "request_type", "Request type").states(REQUEST_TYPES).since(2),
    t(6, I16, RW, "request_flow_line_temperature", "Requested flow line temperature")
        .deci_celsius()
        .since(2),
    t(7, I16, RW, "request_return_line_temperature", "Requested return line temperature")
        .deci_celsius()
        .since(2),
    t(8, I16, RW, "request_heat_sink_temperature_difference", "Requested heat sink spread")
        .unit("K")
        .scaled(0.1, 1)
        .since(2),
    t(9, I16, RW, "modbus_request_heating_capacity", "Requested heating capacity")
        .unit("kW")
        .scaled(0.1, 1)
        .since(2),
    t(50, I16, RW, "maximum_buffer_temperature", "Maximum buffer temperature").deci_celsius(),
];

pub const SOLAR: &[RegisterTemplate] = &[
    t(0, I16, R_, "error_number", "Error number"),
    t(1, U16, R_, "operating_state", "Operating state").states(SOLAR_OPERATING_STATES),
    t(2, I16, R_, "collector_temperature", "Collector temperature").deci_celsius(),
    t(3, I16, R_, "buffer_1_temperature", "Buffer 1 temperature").deci_celsius(),
    t(4, I16, R_, "buffer_2_temperature", "Buffer 2 temperature").deci_celsius(),
    t(50, I16, RW, "maximum_buffer_temperature", "Maximum buffer temperature").deci_celsius(),
    t(51, I16, RW, "buffer_changeover_temperature", "Buffer changeover temperature")
        .deci_celsius(),
];

pub const HEATING_CIRCUIT: &[RegisterTemplate] = &[
    t(0, I16, R_, "error_number", "Error number"),
    t(1, U16, R_, "operating_state", "Operating state").states(HC_OPERATING_STATES),
    t(2, I16, R_, "flow_line_temperature", "Flow line temperature").deci_celsius(),
    t(3, I16, R_, "return_line_temperature", "Return line temperature").deci_celsius(),
    t(4, I16, RW, "room_device_temperature", "Room device temperature").deci_celsius(),
    t(5, I16, RW, "set_flow_line_temperature", "Flow line temperature setpoint").deci_celsius(),
    t(6, I16, RW, "operating_mode", "Operating mode").states(HC_OPERATING_MODES),
    t(7, I16, R_, "target_flow_line_temperature", "Target flow line temperature")
        .deci_celsius()
        .since(3),
    t(50, I16, RW, "set_flow_line_offset_temperature", "Flow line offset temperature")
        .unit("K")
        .scaled(0.1, 1),
    t(51, I16, RW, "target_room_temperature", "Target room temperature").deci_celsius(),
    t(52, I16, RW, "set_cooling_mode_room_temperature", "Cooling mode room temperature")
        .deci_celsius(),
];

const _ASSERT_TEMPLATES_FIT_INSTANCE_BLOCK: () = const {
    let mut kind_idx = 0;
    while kind_idx < DeviceKind::INDEXED.len() {
        let templates = DeviceKind::INDEXED[kind_idx].templates();
        let mut idx = 0;
        while idx < templates.len() {
            let template = &templates[idx];
            let end = template.offset as usize + template.data_type.words();
            assert!(end <= INSTANCE_STRIDE as usize, "template overflows its instance block");
            idx += 1;
        }
        kind_idx += 1;
    }
};
