use std::collections::HashSet;
use std::fmt;

use crate::backend::spec::{Function, Operand};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyError {
    pub missing_value: u32,
    pub instruction_id: Option<u32>,
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.instruction_id {
            Some(instruction) => write!(
                f,
                "operand value {} is missing before instruction {}",
                self.missing_value, instruction
            ),
            None => write!(f, "result value {} is never defined", self.missing_value),
        }
    }
}

impl std::error::Error for TopologyError {}

/// Checks that every operand and result is defined before it is used.
pub fn validate_function_topology(function: &Function) -> Result<(), TopologyError> {
    let mut available = HashSet::new();
    for id in &function.parameter_ids {
        available.insert(id.0);
    }

    for instruction in &function.body {
        for operand in &instruction.operands {
            if let Operand::Value(value) = operand {
                if !available.contains(&value.0) {
                    return Err(TopologyError {
                        missing_value: value.0,
                        instruction_id: Some(instruction.id.0),
                    });
                }
            }
        }
        available.insert(instruction.id.0);
    }

    for result in &function.result_ids {
        if !available.contains(&result.0) {
            return Err(TopologyError {
                missing_value: result.0,
                instruction_id: None,
            });
        }
    }

    Ok(())
}
