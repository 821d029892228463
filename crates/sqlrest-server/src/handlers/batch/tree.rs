//! Batch tree builder: turns a JSON payload into lanes of descriptors.
//!
//! Every whole-batch validation happens here, before any operation starts.

use serde_json::Value;

use sqlrest_domain::resource::resource_segment;
use sqlrest_domain::{OperationDescriptor, ResourceRegistry};

use super::types::{BatchError, BatchPlan, BatchResult, BatchShape, LaneShape};

/// Parses batch payloads against a set of mounted resources.
pub struct BatchTreeBuilder<'a> {
    registry: &'a ResourceRegistry,
    max_operations: usize,
    boundary: Option<&'a str>,
}

impl<'a> BatchTreeBuilder<'a> {
    pub fn new(registry: &'a ResourceRegistry, max_operations: usize) -> Self {
        Self {
            registry,
            max_operations,
            boundary: None,
        }
    }

    /// Restricts every href to one resource type (`PUT /<resource>/batch`).
    pub fn with_boundary(mut self, boundary: Option<&'a str>) -> Self {
        self.boundary = boundary;
        self
    }

    /// Builds a plan from a raw payload.
    ///
    /// A flat array is one sequential lane. An array containing arrays is a
    /// list of lanes, where bare objects become single-operation lanes.
    pub fn build(&self, payload: &Value) -> BatchResult<BatchPlan> {
        let items = payload
            .as_array()
            .ok_or_else(|| BatchError::malformed("batch body must be a JSON array"))?;

        let size = count_operations(items);
        if size > self.max_operations {
            return Err(BatchError::TooLarge {
                size,
                max: self.max_operations,
            });
        }

        let mut next_index = 0;
        if !items.iter().any(Value::is_array) {
            let lane = self.lane(items, &mut next_index)?;
            return Ok(BatchPlan::flat(lane));
        }

        let mut shapes = Vec::with_capacity(items.len());
        let mut lanes = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::Array(sequence) => {
                    shapes.push(LaneShape::Sequence);
                    lanes.push(self.lane(sequence, &mut next_index)?);
                }
                single => {
                    shapes.push(LaneShape::Single);
                    lanes.push(vec![self.descriptor(single, next_index)?]);
                    next_index += 1;
                }
            }
        }
        Ok(BatchPlan {
            shape: BatchShape::Lanes(shapes),
            lanes,
        })
    }

    /// Validates descriptors built in code, e.g. by nested batches.
    pub fn check(&self, plan: &BatchPlan) -> BatchResult<()> {
        if plan.len() > self.max_operations {
            return Err(BatchError::TooLarge {
                size: plan.len(),
                max: self.max_operations,
            });
        }
        for (index, descriptor) in plan.operations().enumerate() {
            self.check_descriptor(descriptor, index)?;
        }
        Ok(())
    }

    fn lane(
        &self,
        items: &[Value],
        next_index: &mut usize,
    ) -> BatchResult<Vec<OperationDescriptor>> {
        items
            .iter()
            .map(|item| {
                let index = *next_index;
                *next_index += 1;
                if item.is_array() {
                    return Err(BatchError::malformed(format!(
                        "operation {index}: lanes cannot be nested more than one level"
                    )));
                }
                self.descriptor(item, index)
            })
            .collect()
    }

    fn descriptor(&self, item: &Value, index: usize) -> BatchResult<OperationDescriptor> {
        let object = item.as_object().ok_or_else(|| {
            BatchError::malformed(format!("operation {index} must be a JSON object"))
        })?;
        let verb = match object.get("verb") {
            Some(Value::String(verb)) if !verb.trim().is_empty() => verb.clone(),
            _ => return Err(BatchError::NoVerb { index }),
        };
        let href = match object.get("href") {
            Some(Value::String(href)) => href.clone(),
            Some(_) => {
                return Err(BatchError::malformed(format!(
                    "operation {index}: href must be a string"
                )))
            }
            None => String::new(),
        };
        let descriptor = OperationDescriptor {
            href,
            verb,
            body: object.get("body").cloned(),
        };
        self.check_descriptor(&descriptor, index)?;
        Ok(descriptor)
    }

    fn check_descriptor(&self, descriptor: &OperationDescriptor, index: usize) -> BatchResult<()> {
        if descriptor.verb.trim().is_empty() {
            return Err(BatchError::NoVerb { index });
        }
        if let Some(boundary) = self.boundary {
            if resource_segment(&descriptor.href) != Some(boundary) {
                return Err(BatchError::HrefAcrossBoundary {
                    href: descriptor.href.clone(),
                    boundary: boundary.to_string(),
                });
            }
        }
        self.registry
            .route(&descriptor.href)
            .map_err(|_| BatchError::NoMatchingRoute {
                href: descriptor.href.clone(),
            })?;
        Ok(())
    }
}

fn count_operations(items: &[Value]) -> usize {
    items
        .iter()
        .map(|item| match item {
            Value::Array(inner) => inner.len(),
            _ => 1,
        })
        .sum()
}
