//! Firmware compatibility tiers.

use std::collections::BTreeMap;

use crate::registers::RegisterTemplate;

/// Released controller firmware versions, oldest first.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::EnumIter, strum::EnumString, strum::IntoStaticStr,
)]
pub enum FirmwareVersion {
    #[strum(serialize = "V0.0.3-3K")]
    V0_0_3,
    #[strum(serialize = "V0.0.4-3K")]
    V0_0_4,
    #[strum(serialize = "V0.0.5-3K")]
    V0_0_5,
    #[strum(serialize = "V0.0.6-3K")]
    V0_0_6,
    #[strum(serialize = "V0.0.7-3K")]
    V0_0_7,
}

impl FirmwareVersion {
    pub const fn tier(self) -> f64 {
        match self {
            FirmwareVersion::V0_0_3 => 1.0,
            FirmwareVersion::V0_0_4 => 2.0,
            FirmwareVersion::V0_0_5 => 3.0,
            FirmwareVersion::V0_0_6 => 4.0,
            FirmwareVersion::V0_0_7 => 5.0,
        }
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name: &'static str = self.into();
        f.write_str(name)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{0}` is neither a known firmware version nor a compatibility tier")]
    UnknownFirmware(String),
}

/// Parse a firmware version name (`V0.0.4-3K`) or a bare compatibility tier (`2`, `2.5`).
pub fn parse_firmware(value: &str) -> Result<f64, Error> {
    let value = value.trim();
    if let Ok(version) = value.parse::<FirmwareVersion>() {
        return Ok(version.tier());
    }
    match value.parse::<f64>() {
        Ok(tier) if tier.is_finite() => Ok(tier),
        _ => Err(Error::UnknownFirmware(value.to_string())),
    }
}

/// Templates of `catalog` which are present in firmware of the given compatibility tier.
pub fn compatible<'a>(
    catalog: impl IntoIterator<Item = &'a RegisterTemplate>,
    firmware_tier: f64,
) -> BTreeMap<&'static str, &'a RegisterTemplate> {
    catalog
        .into_iter()
        .filter(|template| f64::from(template.min_firmware) <= firmware_tier)
        .map(|template| (template.key, template))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::DeviceKind;
    use strum::IntoEnumIterator as _;

    fn template(key: &'static str, min_firmware: u8) -> RegisterTemplate {
        RegisterTemplate {
            key,
            min_firmware,
            ..*DeviceKind::Boiler.template("error_number").unwrap()
        }
    }

    #[test]
    fn filters_by_minimum_firmware() {
        let catalog = [template("default", 1), template("two", 2), template("three", 3)];
        let active = compatible(&catalog, 2.0);
        assert!(active.contains_key("default"));
        assert!(active.contains_key("two"));
        assert!(!active.contains_key("three"));
    }

    #[test]
    fn fractional_tiers_compare_numerically() {
        let catalog = [template("two", 2), template("three", 3)];
        let active = compatible(&catalog, 2.5);
        assert_eq!(active.keys().copied().collect::<Vec<_>>(), ["two"]);
        assert!(compatible(&catalog, 0.5).is_empty());
    }

    #[test]
    fn default_minimum_is_always_included() {
        let boiler = compatible(DeviceKind::Boiler.templates(), 1.0);
        assert!(boiler.contains_key("actual_high_temperature"));
        assert!(boiler.contains_key("target_high_temperature"));
        assert!(!boiler.contains_key("actual_circulation_temperature"));
        let everything = compatible(DeviceKind::Boiler.templates(), 5.0);
        assert_eq!(everything.len(), DeviceKind::Boiler.templates().len());
    }

    #[test]
    fn firmware_versions() {
        assert_eq!(parse_firmware("V0.0.3-3K").unwrap(), 1.0);
        assert_eq!(parse_firmware("V0.0.7-3K").unwrap(), 5.0);
        assert_eq!(parse_firmware(" 2.5 ").unwrap(), 2.5);
        assert!(matches!(parse_firmware("V9"), Err(Error::UnknownFirmware(v)) if v == "V9"));
        assert!(parse_firmware("NaN").is_err());
        let tiers = FirmwareVersion::iter().map(FirmwareVersion::tier).collect::<Vec<_>>();
        assert!(tiers.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(FirmwareVersion::V0_0_5.to_string(), "V0.0.5-3K");
    }
}
