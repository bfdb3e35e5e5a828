use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Integer class id as stored in dataset label arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClassId(pub u32);

impl ClassId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Corruption percentage in `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct Percentage(u32);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("percentage must be within 0..=100, got {0}")]
    PercentageOutOfRange(u32),
    #[error("class id {class} out of range for {num_classes} classes")]
    ClassOutOfRange { class: u32, num_classes: usize },
    #[error("unknown {kind} {value:?}")]
    Unknown { kind: &'static str, value: String },
}

impl Percentage {
    pub const ZERO: Percentage = Percentage(0);
    pub const FULL: Percentage = Percentage(100);

    pub fn new(value: u32) -> Result<Self, TypeError> {
        if value > 100 {
            return Err(TypeError::PercentageOutOfRange(value));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Fraction in `[0, 1]`, used as a Bernoulli rate.
    pub fn as_rate(self) -> f64 {
        f64::from(self.0) / 100.0
    }

    /// `floor(self / 100 * total)` computed without floating point.
    pub fn count_of(self, total: usize) -> usize {
        let scaled = (total as u128) * u128::from(self.0) / 100;
        scaled as usize
    }
}

impl TryFrom<u32> for Percentage {
    type Error = TypeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Percentage::new(value)
    }
}

impl From<Percentage> for u32 {
    fn from(value: Percentage) -> Self {
        value.0
    }
}

impl fmt::Display for Percentage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Which public dataset an experiment runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Cifar10,
    Cifar100,
    Imagenet,
}

impl DatasetKind {
    pub fn name(self) -> &'static str {
        match self {
            DatasetKind::Cifar10 => "cifar10",
            DatasetKind::Cifar100 => "cifar100",
            DatasetKind::Imagenet => "imagenet",
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatasetKind {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "cifar10" => Ok(DatasetKind::Cifar10),
            "cifar100" => Ok(DatasetKind::Cifar100),
            "imagenet" => Ok(DatasetKind::Imagenet),
            _ => Err(TypeError::Unknown {
                kind: "dataset",
                value: s.to_string(),
            }),
        }
    }
}

/// How a sweep corrupts the training set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoisonMode {
    Label,
    Trigger,
}

impl PoisonMode {
    pub fn name(self) -> &'static str {
        match self {
            PoisonMode::Label => "label",
            PoisonMode::Trigger => "trigger",
        }
    }
}

impl fmt::Display for PoisonMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PoisonMode {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "label" => Ok(PoisonMode::Label),
            "trigger" => Ok(PoisonMode::Trigger),
            _ => Err(TypeError::Unknown {
                kind: "poison mode",
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_bounds() {
        assert!(Percentage::new(100).is_ok());
        assert_eq!(
            Percentage::new(101),
            Err(TypeError::PercentageOutOfRange(101))
        );
    }

    #[test]
    fn count_of_floors() {
        let p = Percentage::new(30).unwrap();
        assert_eq!(p.count_of(7), 2);
        assert_eq!(Percentage::new(50).unwrap().count_of(500), 250);
        assert_eq!(Percentage::FULL.count_of(13), 13);
        assert_eq!(Percentage::ZERO.count_of(13), 0);
    }

    #[test]
    fn parse_dataset_kind() {
        assert_eq!("CIFAR-10".parse::<DatasetKind>().unwrap(), DatasetKind::Cifar10);
        assert_eq!("cifar_100".parse::<DatasetKind>().unwrap(), DatasetKind::Cifar100);
        assert!("mnist".parse::<DatasetKind>().is_err());
    }
}
