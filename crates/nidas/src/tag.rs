// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2026 NCAR EOL ISF

//! Static stream metadata: [`SampleTag`] and [`Variable`] (§3). Unlike
//! `Sample`, these describe a stream rather than carry one — created once
//! during configuration and shared by reference for the stream's whole
//! lifetime, the way `hdds`'s `dds::topic` module holds static topic
//! metadata alongside the per-sample data path.

use std::collections::BTreeMap;

use crate::sample::SampleId;

/// A typed attribute value attached to a [`Variable`].
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Text(String),
    Int(i64),
    Float(f64),
}

/// A named channel within a [`SampleTag`] (§3).
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub units: String,
    pub long_name: String,
    attrs: BTreeMap<String, AttrValue>,
}

impl Variable {
    pub fn new(name: impl Into<String>, units: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            units: units.into(),
            long_name: String::new(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_long_name(mut self, long_name: impl Into<String>) -> Self {
        self.long_name = long_name.into();
        self
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: AttrValue) {
        self.attrs.insert(key.into(), value);
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }
}

/// Static description of a produced stream (§3): id, nominal sample rate,
/// and the ordered list of [`Variable`]s it carries. Owned by its producing
/// sensor and outlives every [`crate::sample::Sample`] it describes.
#[derive(Debug, Clone)]
pub struct SampleTag {
    pub id: SampleId,
    /// Nominal samples/sec, 0.0 for aperiodic/event-driven streams.
    pub rate: f64,
    variables: Vec<Variable>,
}

impl SampleTag {
    pub fn new(id: SampleId, rate: f64) -> Self {
        Self {
            id,
            rate,
            variables: Vec::new(),
        }
    }

    pub fn add_variable(&mut self, var: Variable) {
        self.variables.push(var);
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_preserves_variable_order_and_attrs() {
        let mut tag = SampleTag::new(SampleId::new(1, 2, 0).unwrap(), 1.0);
        let mut temp = Variable::new("T", "degC").with_long_name("ambient temperature");
        temp.set_attr("serial_number", AttrValue::Text("A7".into()));
        tag.add_variable(temp);
        tag.add_variable(Variable::new("RH", "%"));

        assert_eq!(tag.variables().len(), 2);
        assert_eq!(tag.variables()[0].name, "T");
        assert_eq!(tag.variables()[1].name, "RH");
        assert_eq!(
            tag.variable("T").unwrap().attr("serial_number"),
            Some(&AttrValue::Text("A7".into()))
        );
    }
}
