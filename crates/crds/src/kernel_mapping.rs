//! Kernel mappings
//!
//! A mapping selects kernels by literal version, regular expression or
//! version range and overrides the image, build and sign recipes for them.

use std::cmp::Ordering;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::build_sign::{Build, Sign};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KernelMapping {
    /// Exact kernel version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal: Option<String>,

    /// Regular expression matched against the kernel version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regexp: Option<String>,

    /// Kernel version range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<KernelVersionRange>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<Sign>,
}

/// Version range; `min` is inclusive and `max` exclusive.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KernelVersionRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
}

/// The single matcher a mapping declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher<'a> {
    Literal(&'a str),
    Regexp(&'a str),
    Range(&'a KernelVersionRange),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("kernel mapping declares no literal, regexp or range")]
    NoMatcher,

    #[error("kernel mapping declares more than one of literal, regexp and range")]
    MultipleMatchers,
}

impl KernelMapping {
    /// Returns the matcher, rejecting mappings with zero or several matchers.
    pub fn matcher(&self) -> Result<Matcher<'_>, MappingError> {
        let mut matchers = Vec::with_capacity(1);
        if let Some(literal) = &self.literal {
            matchers.push(Matcher::Literal(literal));
        }
        if let Some(regexp) = &self.regexp {
            matchers.push(Matcher::Regexp(regexp));
        }
        if let Some(range) = &self.range {
            matchers.push(Matcher::Range(range));
        }
        match matchers.as_slice() {
            [] => Err(MappingError::NoMatcher),
            [matcher] => Ok(*matcher),
            _ => Err(MappingError::MultipleMatchers),
        }
    }
}

impl KernelVersionRange {
    pub fn contains(&self, kernel_version: &str) -> bool {
        let version = numeric_components(kernel_version);
        if let Some(min) = &self.min {
            if compare_components(&version, &numeric_components(min)) == Ordering::Less {
                return false;
            }
        }
        if let Some(max) = &self.max {
            if compare_components(&version, &numeric_components(max)) != Ordering::Less {
                return false;
            }
        }
        true
    }
}

/// Leading numeric components of a kernel version.
///
/// `5.14.0-284.11.1.el9_2.x86_64` yields `[5, 14, 0, 284, 11, 1]`; parsing stops
/// at the first component that is not a number.
pub fn numeric_components(kernel_version: &str) -> Vec<u64> {
    kernel_version
        .split(['.', '-'])
        .map_while(|part| part.parse::<u64>().ok())
        .collect()
}

// Missing trailing components count as zero, so "5.14" == "5.14.0".
fn compare_components(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
