//! Purpose: Build engine query predicates for typed observables.
//! Exports: `DataType`, `Predicate`.
//! Role: Pure string templating used by callers that look up a single value.
//! Invariants: An absent data type yields `Predicate::MatchAll`; callers decide
//!             whether a wildcard is acceptable.
use crate::core::invocation::Query;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DataType {
    Ip,
    Subnet,
    Hash,
    Domain,
}

impl DataType {
    /// Parses an observable type hint; empty or unknown hints yield `None`.
    pub fn from_hint(hint: &str) -> Option<Self> {
        match hint.trim().to_ascii_lowercase().as_str() {
            "ip" => Some(DataType::Ip),
            "subnet" => Some(DataType::Subnet),
            "hash" => Some(DataType::Hash),
            "domain" => Some(DataType::Domain),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Ip => "ip",
            DataType::Subnet => "subnet",
            DataType::Hash => "hash",
            DataType::Domain => "domain",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Predicate {
    IpEquals(String),
    SubnetContains(String),
    Literal(String),
    MatchAll,
}

impl Predicate {
    pub fn for_observable(data_type: Option<DataType>, value: &str) -> Self {
        let value = value.trim().to_string();
        match data_type {
            Some(DataType::Ip) => Predicate::IpEquals(value),
            Some(DataType::Subnet) => Predicate::SubnetContains(value),
            Some(DataType::Hash) | Some(DataType::Domain) => Predicate::Literal(value),
            None => Predicate::MatchAll,
        }
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self, Predicate::MatchAll)
    }

    pub fn expression(&self) -> String {
        match self {
            Predicate::IpEquals(value) => format!(":ip == {value}"),
            Predicate::SubnetContains(value) => format!(":ip in {value}"),
            Predicate::Literal(value) => value.clone(),
            Predicate::MatchAll => String::new(),
        }
    }

    pub fn to_query(&self) -> Query {
        Query::new(self.expression())
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression())
    }
}
