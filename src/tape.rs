//! Operation tape for reverse-mode differentiation
//!
//! While gradient recording is active, every kernel run through the engine
//! appends a [`TapeNode`] in execution order. Computing gradients filters the
//! tape down to the nodes that connect the requested sources to the target,
//! then replays that subset in reverse, accumulating contributions through
//! the chain rule.

use crate::engine::Engine;
use crate::error::{CrucibleError, CrucibleResult};
use crate::tensor::{Tensor, TensorId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

/// Lazily-evaluated gradient for one input of a recorded operation.
///
/// Thunks let the replay skip gradient computation for inputs pruned out of
/// the filtered subgraph.
pub type GradThunk = Box<dyn FnOnce(&Engine) -> CrucibleResult<Tensor>>;

/// Gradient thunks keyed by the input name used when the node was recorded.
pub type InputGradientMap = BTreeMap<String, GradThunk>;

/// Produces per-input gradient thunks from the output gradient and the
/// node's saved tensors.
pub type GradientFn = dyn Fn(&Engine, &Tensor, &[Tensor]) -> CrucibleResult<InputGradientMap>;

/// One recorded operation.
///
/// Node ids are monotonically increasing and reflect recording order; the
/// reverse replay depends on that order.
pub struct TapeNode {
    pub id: usize,
    pub kernel_name: String,
    pub inputs: BTreeMap<String, Tensor>,
    /// Primary output. For kernels producing several outputs, only the first
    /// is tracked for differentiation; this is a known limitation kept for
    /// compatibility with the recording format, not a general rule.
    pub output: Tensor,
    /// Tensors stashed by the forward pass for use in the gradient function.
    /// Held outside any scope and released when the outermost tape ends.
    pub saved: Vec<Tensor>,
    /// Absent for non-differentiable operations.
    pub gradient: Option<Rc<GradientFn>>,
}

/// A tape node restricted to the inputs that lie on a source-to-target path.
pub(crate) struct FilteredNode {
    pub kernel_name: String,
    pub inputs: BTreeMap<String, Tensor>,
    pub output: Tensor,
    pub saved: Vec<Tensor>,
    pub gradient: Option<Rc<GradientFn>>,
}

/// Filter the tape to the minimal subset of nodes connecting any of
/// `sources` to `target`: nodes reachable forward from the sources,
/// intersected with nodes from which the target is reachable backward.
/// Inputs not fed by a source are pruned from the surviving nodes.
pub(crate) fn filter_nodes_sources_to_target(
    tape: &[TapeNode],
    sources: &[Tensor],
    target: &Tensor,
) -> Vec<FilteredNode> {
    // Forward pass: mark tensors computable from the sources.
    let mut tensors_from_sources: HashSet<TensorId> = sources.iter().map(|t| t.id).collect();
    let mut nodes_from_sources: Vec<bool> = vec![false; tape.len()];
    for (i, node) in tape.iter().enumerate() {
        if node
            .inputs
            .values()
            .any(|input| tensors_from_sources.contains(&input.id))
        {
            tensors_from_sources.insert(node.output.id);
            nodes_from_sources[i] = true;
        }
    }

    // Backward pass: mark tensors the target depends on.
    let mut tensors_lead_to_target: HashSet<TensorId> = HashSet::new();
    tensors_lead_to_target.insert(target.id);
    let mut nodes_to_target: Vec<bool> = vec![false; tape.len()];
    for (i, node) in tape.iter().enumerate().rev() {
        if tensors_lead_to_target.contains(&node.output.id) {
            nodes_to_target[i] = true;
            for input in node.inputs.values() {
                tensors_lead_to_target.insert(input.id);
            }
        }
    }

    tape.iter()
        .enumerate()
        .filter(|(i, _)| nodes_from_sources[*i] && nodes_to_target[*i])
        .map(|(_, node)| {
            let pruned_inputs: BTreeMap<String, Tensor> = node
                .inputs
                .iter()
                .filter(|(_, input)| tensors_from_sources.contains(&input.id))
                .map(|(name, input)| (name.clone(), input.clone()))
                .collect();
            FilteredNode {
                kernel_name: node.kernel_name.clone(),
                inputs: pruned_inputs,
                output: node.output.clone(),
                saved: node.saved.clone(),
                gradient: node.gradient.clone(),
            }
        })
        .collect()
}

/// Replay `filtered` in reverse recorded order, accumulating gradients into
/// `accumulated` (keyed by tensor id). Multiple paths into the same tensor
/// sum their contributions elementwise.
pub(crate) fn backpropagate(
    engine: &Engine,
    accumulated: &mut HashMap<TensorId, Tensor>,
    filtered: &[FilteredNode],
) -> CrucibleResult<()> {
    for node in filtered.iter().rev() {
        let output_grad = match accumulated.get(&node.output.id) {
            Some(grad) => grad.clone(),
            // No gradient reached this node's output; nothing to propagate.
            None => continue,
        };
        let gradient = node.gradient.as_ref().ok_or_else(|| {
            CrucibleError::graph(
                "gradients",
                &format!(
                    "cannot compute gradient: no gradient function recorded for kernel '{}'",
                    node.kernel_name
                ),
            )
        })?;
        let mut input_grads = gradient(engine, &output_grad, &node.saved)?;
        for (input_name, input) in &node.inputs {
            let thunk = input_grads.remove(input_name).ok_or_else(|| {
                CrucibleError::graph(
                    "gradients",
                    &format!(
                        "kernel '{}' produced no gradient for input '{}'",
                        node.kernel_name, input_name
                    ),
                )
            })?;
            let input_grad = thunk(engine)?;
            if !input_grad.dtype.is_float() {
                return Err(CrucibleError::graph(
                    "gradients",
                    &format!(
                        "gradient for input '{}' of kernel '{}' has non-float dtype {}",
                        input_name, node.kernel_name, input_grad.dtype
                    ),
                ));
            }
            if input_grad.shape != input.shape {
                return Err(CrucibleError::shape(
                    &format!("gradient of kernel '{}' input '{}'", node.kernel_name, input_name),
                    &format!("{:?}", input.shape),
                    &format!("{:?}", input_grad.shape),
                ));
            }
            match accumulated.get(&input.id) {
                Some(existing) => {
                    let summed = crate::ops::add(engine, existing, &input_grad)?;
                    accumulated.insert(input.id, summed);
                }
                None => {
                    accumulated.insert(input.id, input_grad);
                }
            }
        }
    }
    Ok(())
}
