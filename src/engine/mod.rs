//! The execution engine
//!
//! A single coordinating object that the op layer, the gradient machinery and
//! the backends all talk to. It owns the buffer registry (per-identifier
//! reference counts and byte accounting), the scope stack, and the operation
//! tape, and forwards all numeric work to the active [`Backend`].
//!
//! One engine instance exists per active backend selection. Switching
//! backends means constructing a new engine; tensors issued by the old one
//! become invalid and must not be dereferenced again.
//!
//! All bookkeeping is synchronous within one logical thread of control; only
//! backend readback and timing may suspend. The engine is therefore neither
//! `Send` nor `Sync` by design.

use crate::backend::Backend;
use crate::config::EngineConfig;
use crate::error::{CrucibleError, CrucibleResult};
use crate::profiling::{KernelProfile, ProfileInfo, Profiler};
use crate::tape::{self, GradientFn, InputGradientMap, TapeNode};
use crate::tensor::{tensors_in_container, DType, DataId, Tensor, TensorContainer, TensorId};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;
use std::time::Instant;

/// Engine-level memory report. Byte usage is approximate when the backend
/// cannot report exact live usage.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryInfo {
    pub num_tensors: usize,
    pub num_buffers: usize,
    pub num_bytes: usize,
    pub unreliable: bool,
    pub reasons: Vec<String>,
}

/// Timing report: the backend's own kernel clock plus wall time around it.
#[derive(Debug, Clone, Serialize)]
pub struct TimingInfo {
    pub kernel_ms: f64,
    pub wall_ms: f64,
    pub extra: Option<String>,
}

/// Result of a gradient computation: the target value plus, for each
/// requested source in the order given, the accumulated gradient or `None`
/// if no gradient flowed to that source.
#[derive(Debug, Clone)]
pub struct GradientResult {
    pub value: Tensor,
    pub grads: Vec<Option<Tensor>>,
}

/// User-supplied gradient for a custom-gradient operation: given the output
/// gradient and the saved tensors, produce one gradient per declared input.
pub type CustomGradientFn = Rc<dyn Fn(&Engine, &Tensor, &[Tensor]) -> CrucibleResult<Vec<Tensor>>>;

/// Forward result of a custom-gradient operation.
pub struct CustomGradient {
    pub value: Tensor,
    pub grad_fn: CustomGradientFn,
}

struct BufferInfo {
    ref_count: usize,
    #[allow(dead_code)]
    shape: Vec<usize>,
    #[allow(dead_code)]
    dtype: DType,
    bytes: usize,
}

struct ScopeState {
    id: u64,
    name: String,
    track: Vec<Tensor>,
}

#[derive(Default)]
struct EngineState {
    buffers: HashMap<DataId, BufferInfo>,
    live_tensors: HashSet<TensorId>,
    num_tensors: usize,
    num_buffers: usize,
    num_bytes: usize,

    scope_stack: Vec<ScopeState>,
    next_scope_id: u64,
    kept: HashSet<TensorId>,
    tensor_scope: HashMap<TensorId, u64>,

    // Present only between the start and end of the outermost
    // gradient-recording scope; nested scopes share it.
    tape: Option<Vec<TapeNode>>,
    next_tape_node_id: usize,
    // Nesting depth of gradient scopes. The tape is created at 0 -> 1 and
    // discarded at 1 -> 0.
    gradient_depth: usize,
    // Nesting depth of kernel calls. Above 0 the tape is off, so kernels
    // composed of other ops do not record their internals.
    kernel_depth: usize,

    next_tensor_id: u64,
    next_data_id: u64,

    registered_variables: HashMap<String, Tensor>,

    profiling: bool,
    active_profile: ProfileInfo,
}

/// The execution engine. See the module docs.
pub struct Engine {
    backend: Box<dyn Backend>,
    config: EngineConfig,
    profiler: Profiler,
    state: RefCell<EngineState>,
}

impl Engine {
    pub fn new(backend: Box<dyn Backend>, config: EngineConfig) -> Self {
        tracing::debug!(backend = backend.name(), "constructing execution engine");
        let mut state = EngineState::default();
        state.scope_stack.push(ScopeState {
            id: 0,
            name: "root".to_string(),
            track: Vec::new(),
        });
        state.next_scope_id = 1;
        Self {
            backend,
            config,
            profiler: Profiler::new(),
            state: RefCell::new(state),
        }
    }

    /// Construct an engine over the highest-priority registered backend.
    pub fn from_registry(config: EngineConfig) -> CrucibleResult<Self> {
        Ok(Self::new(crate::backend::create_best_backend()?, config))
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    fn next_tensor_id(&self) -> TensorId {
        let mut state = self.state.borrow_mut();
        let id = state.next_tensor_id;
        state.next_tensor_id += 1;
        TensorId(id)
    }

    fn next_data_id(&self) -> DataId {
        let mut state = self.state.borrow_mut();
        let id = state.next_data_id;
        state.next_data_id += 1;
        DataId(id)
    }

    fn ensure_registered(&self, data_id: DataId, operation: &str) -> CrucibleResult<()> {
        if self.state.borrow().buffers.contains_key(&data_id) {
            Ok(())
        } else {
            Err(CrucibleError::usage(
                operation,
                &format!(
                    "{} is not registered with this engine; the tensor was disposed or created under a different backend",
                    data_id
                ),
            ))
        }
    }

    /// Register a tensor handle: a new buffer identifier initializes its
    /// reference count to 1 and allocates backend storage; an existing one
    /// only gains a reference. Tracked handles join the active scope.
    fn register(&self, tensor: &Tensor, track: bool) -> CrucibleResult<()> {
        let is_new = {
            let mut state = self.state.borrow_mut();
            state.num_tensors += 1;
            state.live_tensors.insert(tensor.id);
            match state.buffers.get_mut(&tensor.data_id) {
                Some(info) => {
                    info.ref_count += 1;
                    false
                }
                None => {
                    let bytes = tensor.bytes();
                    state.buffers.insert(
                        tensor.data_id,
                        BufferInfo {
                            ref_count: 1,
                            shape: tensor.shape.clone(),
                            dtype: tensor.dtype,
                            bytes,
                        },
                    );
                    state.num_buffers += 1;
                    state.num_bytes += bytes;
                    true
                }
            }
        };
        if is_new {
            self.backend.register(tensor.data_id, &tensor.shape, tensor.dtype)?;
        }
        if track {
            let mut state = self.state.borrow_mut();
            let scope_id = match state.scope_stack.last() {
                Some(scope) => scope.id,
                None => {
                    return Err(CrucibleError::InternalError(
                        "no active scope while tracking a tensor".to_string(),
                    ))
                }
            };
            state.tensor_scope.insert(tensor.id, scope_id);
            if let Some(scope) = state.scope_stack.last_mut() {
                scope.track.push(tensor.clone());
            }
        }
        Ok(())
    }

    /// Allocate a fresh zero-filled tensor on the backend and track it in the
    /// active scope.
    pub fn alloc_tensor(&self, shape: Vec<usize>, dtype: DType) -> CrucibleResult<Tensor> {
        let tensor = Tensor {
            id: self.next_tensor_id(),
            data_id: self.next_data_id(),
            shape,
            dtype,
        };
        self.register(&tensor, true)?;
        Ok(tensor)
    }

    /// Allocate a tensor and upload the given values.
    pub fn make_tensor(
        &self,
        values: Vec<f32>,
        shape: Vec<usize>,
        dtype: DType,
    ) -> CrucibleResult<Tensor> {
        let expected = crate::tensor::size_from_shape(&shape);
        if values.len() != expected {
            return Err(CrucibleError::shape(
                "make_tensor",
                &format!("{} values for shape {:?}", expected, shape),
                &format!("{} values", values.len()),
            ));
        }
        let tensor = self.alloc_tensor(shape, dtype)?;
        self.backend.write(tensor.data_id, &values)?;
        Ok(tensor)
    }

    /// Create a new handle sharing the given tensor's buffer. Increments the
    /// buffer's reference count and tracks the handle in the active scope.
    pub fn alias(&self, tensor: &Tensor) -> CrucibleResult<Tensor> {
        self.alias_as(tensor, tensor.shape.clone())
    }

    /// Alias with a different shape over the same buffer
    /// (reshape-without-copy). Element counts must match.
    pub fn alias_as(&self, tensor: &Tensor, shape: Vec<usize>) -> CrucibleResult<Tensor> {
        if crate::tensor::size_from_shape(&shape) != tensor.size() {
            return Err(CrucibleError::shape(
                "alias",
                &format!("{} elements", tensor.size()),
                &format!("{:?}", shape),
            ));
        }
        self.ensure_registered(tensor.data_id, "alias")?;
        let handle = Tensor {
            id: self.next_tensor_id(),
            data_id: tensor.data_id,
            shape,
            dtype: tensor.dtype,
        };
        self.register(&handle, true)?;
        Ok(handle)
    }

    /// Clone a handle for the tape's save list: shares the buffer but is not
    /// tracked by any scope. Released when the outermost tape is discarded.
    fn clone_for_tape(&self, tensor: &Tensor) -> CrucibleResult<Tensor> {
        self.ensure_registered(tensor.data_id, "save")?;
        let handle = Tensor {
            id: self.next_tensor_id(),
            data_id: tensor.data_id,
            shape: tensor.shape.clone(),
            dtype: tensor.dtype,
        };
        self.register(&handle, false)?;
        Ok(handle)
    }

    /// Dispose a tensor handle. Idempotent: disposing an already-disposed
    /// handle is a no-op. When the buffer's reference count reaches zero the
    /// backend storage is freed.
    pub fn dispose_tensor(&self, tensor: &Tensor) -> CrucibleResult<()> {
        let freed = {
            let mut state = self.state.borrow_mut();
            if !state.live_tensors.remove(&tensor.id) {
                return Ok(());
            }
            state.tensor_scope.remove(&tensor.id);
            state.kept.remove(&tensor.id);
            let ref_count = match state.buffers.get(&tensor.data_id) {
                Some(info) => info.ref_count,
                None => return Ok(()),
            };
            state.num_tensors -= 1;
            if ref_count <= 1 {
                if let Some(info) = state.buffers.remove(&tensor.data_id) {
                    state.num_buffers -= 1;
                    state.num_bytes -= info.bytes;
                }
                Some(tensor.data_id)
            } else {
                if let Some(info) = state.buffers.get_mut(&tensor.data_id) {
                    info.ref_count -= 1;
                }
                None
            }
        };
        if let Some(data_id) = freed {
            self.backend.dispose_data(data_id)?;
        }
        Ok(())
    }

    // Variables: long-lived named tensors, registered but never
    // scope-tracked, so optimizers can hold weights across tidy calls.

    pub fn make_variable(&self, name: &str, init: &Tensor) -> CrucibleResult<Tensor> {
        if self.state.borrow().registered_variables.contains_key(name) {
            return Err(CrucibleError::usage(
                "make_variable",
                &format!("variable '{}' was already registered", name),
            ));
        }
        self.ensure_registered(init.data_id, "make_variable")?;
        let handle = Tensor {
            id: self.next_tensor_id(),
            data_id: init.data_id,
            shape: init.shape.clone(),
            dtype: init.dtype,
        };
        self.register(&handle, false)?;
        self.state
            .borrow_mut()
            .registered_variables
            .insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn variable(&self, name: &str) -> Option<Tensor> {
        self.state.borrow().registered_variables.get(name).cloned()
    }

    pub fn dispose_variable(&self, name: &str) -> CrucibleResult<()> {
        let removed = self.state.borrow_mut().registered_variables.remove(name);
        if let Some(handle) = removed {
            self.dispose_tensor(&handle)?;
        }
        Ok(())
    }

    pub fn dispose_variables(&self) -> CrucibleResult<()> {
        let handles: Vec<Tensor> = {
            let mut state = self.state.borrow_mut();
            state.registered_variables.drain().map(|(_, v)| v).collect()
        };
        for handle in handles {
            self.dispose_tensor(&handle)?;
        }
        Ok(())
    }

    // Scopes

    /// Push a new allocation scope, making it active. With `gradient_mode`,
    /// the outermost such scope also creates a fresh tape; nested ones share
    /// it through the depth counter.
    pub fn start_scope(&self, name: Option<&str>, gradient_mode: bool) {
        let mut state = self.state.borrow_mut();
        if gradient_mode {
            if state.gradient_depth == 0 {
                state.tape = Some(Vec::new());
            }
            state.gradient_depth += 1;
        }
        let id = state.next_scope_id;
        state.next_scope_id += 1;
        let name = name.unwrap_or("unnamed scope");
        tracing::trace!(scope = name, id, "opening scope");
        state.scope_stack.push(ScopeState {
            id,
            name: name.to_string(),
            track: Vec::new(),
        });
    }

    /// Close the active scope. Tensors in `result` are preserved and
    /// re-parented to the enclosing scope; tensors referenced by a still-live
    /// tape edge are re-parented as well (the gradient engine may need them
    /// later); kept tensors survive unscoped; everything else is disposed.
    pub fn end_scope(&self, result: &[Tensor], gradient_mode: bool) -> CrucibleResult<()> {
        let mut saved_to_dispose: Vec<Tensor> = Vec::new();
        let to_dispose: Vec<Tensor> = {
            let mut state = self.state.borrow_mut();
            if gradient_mode {
                if state.gradient_depth == 0 {
                    return Err(CrucibleError::InternalError(
                        "gradient scope closed more times than it was opened".to_string(),
                    ));
                }
                state.gradient_depth -= 1;
                if state.gradient_depth == 0 {
                    if let Some(tape) = state.tape.take() {
                        for node in tape {
                            saved_to_dispose.extend(node.saved);
                        }
                    }
                }
            }
            let scope = match state.scope_stack.pop() {
                Some(scope) => scope,
                None => {
                    return Err(CrucibleError::InternalError(
                        "scope stack underflow".to_string(),
                    ))
                }
            };
            tracing::trace!(scope = %scope.name, id = scope.id, "closing scope");
            if state.scope_stack.is_empty() {
                let id = state.next_scope_id;
                state.next_scope_id += 1;
                state.scope_stack.push(ScopeState {
                    id,
                    name: "root".to_string(),
                    track: Vec::new(),
                });
            }
            let closing_id = scope.id;
            let preserved: HashSet<TensorId> = result.iter().map(|t| t.id).collect();
            let tape_ids: HashSet<TensorId> = match &state.tape {
                Some(tape) => tape
                    .iter()
                    .flat_map(|node| {
                        node.inputs
                            .values()
                            .map(|t| t.id)
                            .chain(std::iter::once(node.output.id))
                            .chain(node.saved.iter().map(|t| t.id))
                    })
                    .collect(),
                None => HashSet::new(),
            };
            let parent_id = match state.scope_stack.last() {
                Some(scope) => scope.id,
                None => {
                    return Err(CrucibleError::InternalError(
                        "scope stack empty after root synthesis".to_string(),
                    ))
                }
            };
            let mut to_dispose = Vec::new();
            let mut reparent = Vec::new();
            for tensor in scope.track {
                // Skip handles disposed inside the scope or already re-owned.
                if state.tensor_scope.get(&tensor.id) != Some(&closing_id) {
                    continue;
                }
                if state.kept.contains(&tensor.id) {
                    // Kept tensors survive unscoped; the caller disposes them.
                    state.tensor_scope.remove(&tensor.id);
                    continue;
                }
                if preserved.contains(&tensor.id) || tape_ids.contains(&tensor.id) {
                    reparent.push(tensor);
                } else {
                    to_dispose.push(tensor);
                }
            }
            for tensor in &reparent {
                state.tensor_scope.insert(tensor.id, parent_id);
            }
            if let Some(parent) = state.scope_stack.last_mut() {
                parent.track.extend(reparent);
            }
            to_dispose
        };
        for tensor in to_dispose {
            self.dispose_tensor(&tensor)?;
        }
        for tensor in saved_to_dispose {
            self.dispose_tensor(&tensor)?;
        }
        Ok(())
    }

    /// Run `f` inside a fresh scope; tensors it allocates and does not return
    /// are disposed when it finishes. The scope is closed on both the success
    /// and the failure path, so tracking state never leaks.
    pub fn tidy<T, F>(&self, f: F) -> CrucibleResult<T>
    where
        T: TensorContainer,
        F: FnOnce(&Engine) -> CrucibleResult<T>,
    {
        self.tidy_named("unnamed scope", f)
    }

    pub fn tidy_named<T, F>(&self, name: &str, f: F) -> CrucibleResult<T>
    where
        T: TensorContainer,
        F: FnOnce(&Engine) -> CrucibleResult<T>,
    {
        self.start_scope(Some(name), false);
        let result = f(self);
        let preserved = match &result {
            Ok(value) => tensors_in_container(value),
            Err(_) => Vec::new(),
        };
        let ended = self.end_scope(&preserved, false);
        match (result, ended) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
        }
    }

    /// Exempt a tensor from scope-based auto-disposal. Must be called inside
    /// at least one explicit scope; at the root there is nothing to exempt
    /// from and the call would silently leak, so it is rejected.
    pub fn keep(&self, tensor: &Tensor) -> CrucibleResult<()> {
        let mut state = self.state.borrow_mut();
        if state.scope_stack.len() <= 1 {
            return Err(CrucibleError::usage(
                "keep",
                "called outside of any explicit scope; wrap the computation in tidy()",
            ));
        }
        state.kept.insert(tensor.id);
        Ok(())
    }

    // Kernel execution and recording

    /// Whether operations are currently recorded onto the tape.
    pub fn is_tape_on(&self) -> bool {
        let state = self.state.borrow();
        state.gradient_depth > 0 && state.kernel_depth == 0
    }

    /// Execute a kernel against the current backend. While the forward
    /// function runs, recording is suspended so kernels composed of other
    /// ops do not record their internals. Afterwards, if recording is active
    /// and a backward function was supplied, a tape node is appended
    /// capturing the inputs and the primary output.
    pub fn run_kernel<F>(
        &self,
        kernel_name: &str,
        inputs: BTreeMap<String, Tensor>,
        forward: F,
        backward: Option<Rc<GradientFn>>,
    ) -> CrucibleResult<Vec<Tensor>>
    where
        F: FnOnce(&Engine, &mut dyn FnMut(&Tensor) -> CrucibleResult<()>) -> CrucibleResult<Vec<Tensor>>,
    {
        let (tape_on, profiling, start_bytes, start_tensors) = {
            let state = self.state.borrow();
            (
                state.gradient_depth > 0 && state.kernel_depth == 0,
                state.profiling,
                state.num_bytes,
                state.num_tensors,
            )
        };
        let input_shapes: Vec<Vec<usize>> = inputs.values().map(|t| t.shape.clone()).collect();

        let mut saved: Vec<Tensor> = Vec::new();
        self.state.borrow_mut().kernel_depth += 1;
        let result = {
            let mut save = |tensor: &Tensor| -> CrucibleResult<()> {
                // Saving without an active tape would leak: nothing would
                // ever run backprop and release the clone.
                if tape_on {
                    saved.push(self.clone_for_tape(tensor)?);
                }
                Ok(())
            };
            if self.config.debug {
                self.profiler
                    .profile_kernel(kernel_name, self, || forward(self, &mut save))
            } else {
                forward(self, &mut save)
            }
        };
        self.state.borrow_mut().kernel_depth -= 1;
        let outputs = result?;

        if tape_on {
            let output = outputs.first().cloned().ok_or_else(|| {
                CrucibleError::usage(
                    "run_kernel",
                    &format!("kernel '{}' produced no outputs", kernel_name),
                )
            })?;
            let mut state = self.state.borrow_mut();
            let id = state.next_tape_node_id;
            state.next_tape_node_id += 1;
            let node = TapeNode {
                id,
                kernel_name: kernel_name.to_string(),
                inputs,
                output,
                saved,
                gradient: backward,
            };
            match state.tape.as_mut() {
                Some(tape) => tape.push(node),
                None => {
                    return Err(CrucibleError::InternalError(
                        "recording is active but no tape exists".to_string(),
                    ))
                }
            }
        }

        if profiling {
            let mut state = self.state.borrow_mut();
            let kernel = KernelProfile {
                name: kernel_name.to_string(),
                bytes_added: state.num_bytes as i64 - start_bytes as i64,
                total_bytes_snapshot: state.num_bytes,
                tensors_added: state.num_tensors as i64 - start_tensors as i64,
                total_tensors_snapshot: state.num_tensors,
                input_shapes,
                output_shapes: outputs.iter().map(|t| t.shape.clone()).collect(),
            };
            state.active_profile.kernels.push(kernel);
        }

        Ok(outputs)
    }

    /// Treat a user-supplied forward/gradient pair as one atomic
    /// differentiable operation, bypassing whatever tape entries its own
    /// implementation would otherwise create.
    ///
    /// The gradient function must return exactly one gradient per declared
    /// input; a mismatch is a fatal usage error raised when the gradient
    /// engine invokes it.
    pub fn custom_grad<F>(&self, name: &str, inputs: &[Tensor], f: F) -> CrucibleResult<Tensor>
    where
        F: FnOnce(
            &Engine,
            &[Tensor],
            &mut dyn FnMut(&Tensor) -> CrucibleResult<()>,
        ) -> CrucibleResult<CustomGradient>,
    {
        let input_map: BTreeMap<String, Tensor> = inputs
            .iter()
            .enumerate()
            .map(|(i, t)| (i.to_string(), t.clone()))
            .collect();
        let input_count = inputs.len();
        let op_name = name.to_string();
        let grad_slot: Rc<RefCell<Option<CustomGradientFn>>> = Rc::new(RefCell::new(None));

        let slot = grad_slot.clone();
        let backward: Rc<GradientFn> = Rc::new(move |engine, output_grad, saved| {
            let grad_fn = slot.borrow().clone().ok_or_else(|| {
                CrucibleError::InternalError(format!(
                    "custom gradient for '{}' invoked before its forward pass",
                    op_name
                ))
            })?;
            let grads = grad_fn(engine, output_grad, saved)?;
            if grads.len() != input_count {
                return Err(CrucibleError::usage(
                    "custom_grad",
                    &format!(
                        "the gradient function for '{}' returned {} gradients but the forward function takes {} inputs",
                        op_name,
                        grads.len(),
                        input_count
                    ),
                ));
            }
            let map: InputGradientMap = grads
                .into_iter()
                .enumerate()
                .map(|(i, grad)| {
                    (
                        i.to_string(),
                        Box::new(move |_: &Engine| Ok(grad)) as crate::tape::GradThunk,
                    )
                })
                .collect();
            Ok(map)
        });

        let outputs = self.run_kernel(
            name,
            input_map,
            move |engine, save| {
                let custom = f(engine, inputs, save)?;
                *grad_slot.borrow_mut() = Some(custom.grad_fn);
                Ok(vec![custom.value])
            },
            Some(backward),
        )?;
        outputs.into_iter().next().ok_or_else(|| {
            CrucibleError::InternalError("custom_grad produced no output".to_string())
        })
    }

    // Gradients

    /// Compute gradients of `f` with respect to each of `sources`.
    ///
    /// `f` runs inside a fresh gradient-mode scope so a new tape records
    /// exactly its operations. The tape is filtered to the subgraph
    /// connecting the sources to the returned value and replayed in reverse
    /// recorded order; contributions arriving at the same tensor over
    /// multiple paths are summed. `output_grad` seeds the accumulation and
    /// defaults to an all-ones tensor of the target's shape.
    pub fn gradients<F>(
        &self,
        f: F,
        sources: &[Tensor],
        output_grad: Option<Tensor>,
        allow_no_gradients: bool,
    ) -> CrucibleResult<GradientResult>
    where
        F: FnOnce(&Engine) -> CrucibleResult<Tensor>,
    {
        if sources.is_empty() {
            return Err(CrucibleError::usage(
                "gradients",
                "received an empty list of sources",
            ));
        }
        if let Some(dy) = &output_grad {
            if !dy.dtype.is_float() {
                return Err(CrucibleError::usage(
                    "gradients",
                    &format!("the output gradient must have a float dtype, got {}", dy.dtype),
                ));
            }
        }
        self.start_scope(Some("gradient"), true);
        let result = self.run_gradients(f, sources, output_grad, allow_no_gradients);
        let mut preserved: Vec<Tensor> = Vec::new();
        if let Ok(res) = &result {
            preserved.push(res.value.clone());
            preserved.extend(res.grads.iter().flatten().cloned());
        }
        let ended = self.end_scope(&preserved, true);
        match (result, ended) {
            (Ok(res), Ok(())) => Ok(res),
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
        }
    }

    fn run_gradients<F>(
        &self,
        f: F,
        sources: &[Tensor],
        output_grad: Option<Tensor>,
        allow_no_gradients: bool,
    ) -> CrucibleResult<GradientResult>
    where
        F: FnOnce(&Engine) -> CrucibleResult<Tensor>,
    {
        let value = self.tidy_named("forward", |engine| f(engine))?;
        if !value.dtype.is_float() {
            return Err(CrucibleError::usage(
                "gradients",
                &format!(
                    "the differentiated function must return a float tensor, got {}",
                    value.dtype
                ),
            ));
        }
        let filtered = {
            let state = self.state.borrow();
            let tape = state.tape.as_ref().ok_or_else(|| {
                CrucibleError::InternalError("gradient recording is not active".to_string())
            })?;
            tape::filter_nodes_sources_to_target(tape, sources, &value)
        };
        if filtered.is_empty() && !allow_no_gradients {
            return Err(CrucibleError::graph(
                "gradients",
                "the target value does not depend on any of the given sources; make sure the differentiated function encloses every operation from the sources to the target",
            ));
        }
        let (value, grads) = self.tidy_named("backward", move |engine| {
            let mut accumulated: HashMap<TensorId, Tensor> = HashMap::new();
            let seed = match output_grad {
                Some(dy) => dy,
                None => crate::ops::ones(engine, &value.shape)?,
            };
            accumulated.insert(value.id, seed);
            tape::backpropagate(engine, &mut accumulated, &filtered)?;
            let grads: Vec<Option<Tensor>> = sources
                .iter()
                .map(|source| accumulated.get(&source.id).cloned())
                .collect();
            Ok((value, grads))
        })?;
        Ok(GradientResult { value, grads })
    }

    // Diagnostics and data transfer

    /// Current tensor/buffer/byte counters merged with the backend's own
    /// report. Explicitly approximate when the backend says so.
    pub fn memory(&self) -> MemoryInfo {
        let backend_info = self.backend.memory();
        let state = self.state.borrow();
        MemoryInfo {
            num_tensors: state.num_tensors,
            num_buffers: state.num_buffers,
            num_bytes: state.num_bytes,
            unreliable: backend_info.unreliable,
            reasons: backend_info.reasons,
        }
    }

    /// Run `query` while recording a per-kernel allocation profile.
    pub fn profile<T, F>(&self, query: F) -> CrucibleResult<(ProfileInfo, T)>
    where
        F: FnOnce(&Engine) -> CrucibleResult<T>,
    {
        let (start_bytes, start_tensors) = {
            let mut state = self.state.borrow_mut();
            if state.profiling {
                return Err(CrucibleError::usage("profile", "a profile is already active"));
            }
            state.profiling = true;
            state.active_profile = ProfileInfo::default();
            (state.num_bytes, state.num_tensors)
        };
        let result = query(self);
        let profile = {
            let mut state = self.state.borrow_mut();
            state.profiling = false;
            let mut profile = std::mem::take(&mut state.active_profile);
            profile.new_bytes = state.num_bytes as i64 - start_bytes as i64;
            profile.new_tensors = state.num_tensors as i64 - start_tensors as i64;
            profile.peak_bytes = profile
                .kernels
                .iter()
                .map(|k| k.total_bytes_snapshot)
                .max()
                .unwrap_or(state.num_bytes);
            profile
        };
        Ok((profile, result?))
    }

    /// Synchronous readback of a tensor's values.
    pub fn read_sync(&self, tensor: &Tensor) -> CrucibleResult<Vec<f32>> {
        self.ensure_registered(tensor.data_id, "read")?;
        self.backend.read_sync(tensor.data_id)
    }

    /// Asynchronous readback; one of the engine's two suspension points.
    pub async fn read(&self, tensor: &Tensor) -> CrucibleResult<Vec<f32>> {
        self.ensure_registered(tensor.data_id, "read")?;
        self.backend.read(tensor.data_id).await
    }

    /// Time a unit of work on the backend's clock, adding wall time.
    pub async fn time<F>(&self, mut f: F) -> CrucibleResult<TimingInfo>
    where
        F: FnMut() -> CrucibleResult<()>,
    {
        let start = Instant::now();
        let timing = self.backend.time(&mut f).await?;
        Ok(TimingInfo {
            kernel_ms: timing.kernel_ms,
            wall_ms: start.elapsed().as_secs_f64() * 1e3,
            extra: timing.extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::ops;
    use crate::tape::GradThunk;

    fn test_engine() -> Engine {
        Engine::new(Box::new(CpuBackend::new()), EngineConfig::default())
    }

    #[test]
    fn test_tidy_disposes_everything_but_the_result() {
        let engine = test_engine();
        let before = engine.memory();
        let result = engine
            .tidy(|e| {
                let a = ops::tensor(e, &[1.0, 2.0, 3.0], &[3])?;
                let b = ops::tensor(e, &[4.0, 5.0, 6.0], &[3])?;
                ops::mul(e, &a, &b)
            })
            .unwrap();
        let after = engine.memory();
        assert_eq!(after.num_tensors, before.num_tensors + 1);
        assert_eq!(after.num_buffers, before.num_buffers + 1);
        assert_eq!(after.num_bytes, before.num_bytes + result.bytes());
        assert_eq!(engine.read_sync(&result).unwrap(), vec![4.0, 10.0, 18.0]);
    }

    #[test]
    fn test_tidy_closes_scope_on_error() {
        let engine = test_engine();
        let before = engine.memory();
        let err = engine
            .tidy(|e| -> CrucibleResult<Tensor> {
                let _garbage = ops::ones(e, &[16])?;
                Err(CrucibleError::InternalError("forced failure".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, CrucibleError::InternalError(_)));
        let after = engine.memory();
        assert_eq!(after.num_tensors, before.num_tensors);
        assert_eq!(after.num_bytes, before.num_bytes);
        assert_eq!(engine.state.borrow().scope_stack.len(), 1);
    }

    #[test]
    fn test_nested_tidy_result_survives_to_outer_scope() {
        let engine = test_engine();
        let result = engine
            .tidy(|e| {
                let inner = e.tidy(|e| {
                    let a = ops::tensor(e, &[2.0], &[1])?;
                    ops::add(e, &a, &a)
                })?;
                // The inner result must still be readable in the outer scope.
                assert_eq!(e.read_sync(&inner).unwrap(), vec![4.0]);
                ops::mul(e, &inner, &inner)
            })
            .unwrap();
        assert_eq!(engine.read_sync(&result).unwrap(), vec![16.0]);
    }

    #[test]
    fn test_refcount_aliasing() {
        let engine = test_engine();
        let t1 = ops::tensor(&engine, &[1.0, 2.0], &[2]).unwrap();
        let t2 = engine.alias(&t1).unwrap();
        engine.dispose_tensor(&t1).unwrap();
        assert_eq!(engine.read_sync(&t2).unwrap(), vec![1.0, 2.0]);
        engine.dispose_tensor(&t2).unwrap();
        assert!(matches!(
            engine.read_sync(&t2).unwrap_err(),
            CrucibleError::UsageError(_)
        ));
    }

    #[test]
    fn test_double_dispose_of_one_handle_is_a_noop() {
        let engine = test_engine();
        let t1 = ops::tensor(&engine, &[5.0], &[1]).unwrap();
        let t2 = engine.alias(&t1).unwrap();
        engine.dispose_tensor(&t1).unwrap();
        engine.dispose_tensor(&t1).unwrap();
        assert_eq!(engine.read_sync(&t2).unwrap(), vec![5.0]);
    }

    #[test]
    fn test_gradient_sum_law() {
        // f(x) = x*x + x, so df/dx at x=3 is 2*3 + 1 = 7. The x*x path and
        // the +x path must sum their contributions.
        let engine = test_engine();
        let x = ops::scalar(&engine, 3.0).unwrap();
        let result = engine
            .gradients(
                |e| {
                    let squared = ops::mul(e, &x, &x)?;
                    ops::add(e, &squared, &x)
                },
                std::slice::from_ref(&x),
                None,
                false,
            )
            .unwrap();
        assert_eq!(engine.read_sync(&result.value).unwrap(), vec![12.0]);
        let grad = result.grads[0].as_ref().unwrap();
        assert_eq!(engine.read_sync(grad).unwrap(), vec![7.0]);
    }

    #[test]
    fn test_empty_sources_is_a_usage_error() {
        let engine = test_engine();
        let err = engine
            .gradients(|e| ops::scalar(e, 1.0), &[], None, false)
            .unwrap_err();
        assert!(matches!(err, CrucibleError::UsageError(_)));
    }

    #[test]
    fn test_no_path_detection() {
        let engine = test_engine();
        let x = ops::scalar(&engine, 2.0).unwrap();
        let err = engine
            .gradients(|e| ops::scalar(e, 5.0), std::slice::from_ref(&x), None, false)
            .unwrap_err();
        assert!(matches!(err, CrucibleError::GraphError(_)));

        // With allow_no_gradients the same computation yields an explicit
        // missing gradient instead of failing.
        let result = engine
            .gradients(|e| ops::scalar(e, 5.0), std::slice::from_ref(&x), None, true)
            .unwrap();
        assert!(result.grads[0].is_none());
    }

    #[test]
    fn test_nested_gradients_share_one_tape() {
        // Second-order: f(x) = x*x, df/dx = 2x, d2f/dx2 = 2.
        let engine = test_engine();
        let x = ops::scalar(&engine, 3.0).unwrap();
        let outer = engine
            .gradients(
                |e| {
                    let inner = e.gradients(
                        |e2| ops::mul(e2, &x, &x),
                        std::slice::from_ref(&x),
                        None,
                        false,
                    )?;
                    inner.grads.into_iter().next().flatten().ok_or_else(|| {
                        CrucibleError::InternalError("missing inner gradient".to_string())
                    })
                },
                std::slice::from_ref(&x),
                None,
                false,
            )
            .unwrap();
        assert_eq!(engine.read_sync(&outer.value).unwrap(), vec![6.0]);
        let second = outer.grads[0].as_ref().unwrap();
        assert_eq!(engine.read_sync(second).unwrap(), vec![2.0]);
        // Only the outermost scope's closing clears the tape.
        assert!(engine.state.borrow().tape.is_none());
        assert_eq!(engine.state.borrow().gradient_depth, 0);
    }

    #[test]
    fn test_gradients_closes_scopes_on_failure() {
        let engine = test_engine();
        let x = ops::scalar(&engine, 1.0).unwrap();
        let err = engine
            .gradients(
                |_| -> CrucibleResult<Tensor> {
                    Err(CrucibleError::InternalError("forward failed".to_string()))
                },
                std::slice::from_ref(&x),
                None,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, CrucibleError::InternalError(_)));
        assert!(engine.state.borrow().tape.is_none());
        assert_eq!(engine.state.borrow().gradient_depth, 0);
        assert_eq!(engine.state.borrow().scope_stack.len(), 1);
    }

    #[test]
    fn test_keep_exempts_from_scope_disposal() {
        let engine = test_engine();
        let before = engine.memory();
        let mut kept: Option<Tensor> = None;
        engine
            .tidy(|e| {
                let t = ops::tensor(e, &[7.0, 8.0], &[2])?;
                e.keep(&t)?;
                kept = Some(t);
                let _garbage = ops::ones(e, &[4])?;
                Ok(())
            })
            .unwrap();
        let kept = kept.unwrap();
        assert_eq!(engine.read_sync(&kept).unwrap(), vec![7.0, 8.0]);
        engine.dispose_tensor(&kept).unwrap();
        assert!(engine.read_sync(&kept).is_err());
        // A second dispose is a no-op, not a double-free.
        engine.dispose_tensor(&kept).unwrap();
        let after = engine.memory();
        assert_eq!(after.num_tensors, before.num_tensors);
        assert_eq!(after.num_bytes, before.num_bytes);
    }

    #[test]
    fn test_keep_at_root_scope_is_rejected() {
        let engine = test_engine();
        let t = ops::scalar(&engine, 1.0).unwrap();
        let err = engine.keep(&t).unwrap_err();
        assert!(matches!(err, CrucibleError::UsageError(_)));
    }

    #[test]
    fn test_custom_grad_arity_mismatch_is_fatal() {
        let engine = test_engine();
        let a = ops::scalar(&engine, 2.0).unwrap();
        let b = ops::scalar(&engine, 3.0).unwrap();
        let inputs = vec![a.clone(), b.clone()];
        let err = engine
            .gradients(
                |e| {
                    e.custom_grad("BadMul", &inputs, |e, ins, _save| {
                        let value = ops::mul(e, &ins[0], &ins[1])?;
                        // Two inputs, but only one gradient returned.
                        let grad_fn: CustomGradientFn =
                            Rc::new(|e, dy, _| Ok(vec![ops::identity(e, dy)?]));
                        Ok(CustomGradient { value, grad_fn })
                    })
                },
                &[a.clone(), b.clone()],
                None,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, CrucibleError::UsageError(_)));
        assert!(err.to_string().contains("returned 1 gradients"));
    }

    #[test]
    fn test_custom_grad_replaces_internal_tape_entries() {
        let engine = test_engine();
        let a = ops::scalar(&engine, 2.0).unwrap();
        let b = ops::scalar(&engine, 3.0).unwrap();
        let inputs = vec![a.clone(), b.clone()];
        let result = engine
            .gradients(
                |e| {
                    e.custom_grad("CustomMul", &inputs, |e, ins, save| {
                        let value = ops::mul(e, &ins[0], &ins[1])?;
                        save(&ins[0])?;
                        save(&ins[1])?;
                        let grad_fn: CustomGradientFn = Rc::new(|e, dy, saved| {
                            let da = ops::mul(e, dy, &saved[1])?;
                            let db = ops::mul(e, dy, &saved[0])?;
                            Ok(vec![da, db])
                        });
                        Ok(CustomGradient { value, grad_fn })
                    })
                },
                &inputs,
                None,
                false,
            )
            .unwrap();
        assert_eq!(engine.read_sync(&result.value).unwrap(), vec![6.0]);
        let da = result.grads[0].as_ref().unwrap();
        let db = result.grads[1].as_ref().unwrap();
        assert_eq!(engine.read_sync(da).unwrap(), vec![3.0]);
        assert_eq!(engine.read_sync(db).unwrap(), vec![2.0]);
    }

    #[test]
    fn test_kernel_internals_are_not_recorded() {
        let engine = test_engine();
        engine.start_scope(Some("recording"), true);
        let x = ops::scalar(&engine, 2.0).unwrap();
        let backward: Rc<GradientFn> = Rc::new(|_, dy, _| {
            let dy = dy.clone();
            let mut map = InputGradientMap::new();
            map.insert(
                "x".to_string(),
                Box::new(move |e: &Engine| ops::identity(e, &dy)) as GradThunk,
            );
            Ok(map)
        });
        let outputs = engine
            .run_kernel(
                "Composite",
                [("x".to_string(), x.clone())].into_iter().collect(),
                |e, _save| {
                    // Composed of another op; must not add its own tape node.
                    let doubled = ops::add(e, &x, &x)?;
                    Ok(vec![doubled])
                },
                Some(backward),
            )
            .unwrap();
        assert_eq!(engine.read_sync(&outputs[0]).unwrap(), vec![4.0]);
        assert_eq!(engine.state.borrow().tape.as_ref().unwrap().len(), 1);
        engine.end_scope(&[], true).unwrap();
    }

    #[test]
    fn test_variables_are_not_scope_tracked() {
        let engine = test_engine();
        let init = ops::tensor(&engine, &[0.5, 0.5], &[2]).unwrap();
        let weights = engine.make_variable("weights", &init).unwrap();
        assert!(engine.make_variable("weights", &init).is_err());
        engine
            .tidy(|e| {
                let _garbage = ops::ones(e, &[8])?;
                Ok(())
            })
            .unwrap();
        assert_eq!(engine.read_sync(&weights).unwrap(), vec![0.5, 0.5]);
        engine.dispose_tensor(&init).unwrap();
        engine.dispose_variables().unwrap();
        assert!(engine.read_sync(&weights).is_err());
    }

    #[test]
    fn test_foreign_tensor_is_a_usage_error() {
        let old_engine = test_engine();
        let t = ops::scalar(&old_engine, 1.0).unwrap();
        let new_engine = test_engine();
        assert!(matches!(
            new_engine.read_sync(&t).unwrap_err(),
            CrucibleError::UsageError(_)
        ));
    }

    #[test]
    fn test_profile_records_kernels() {
        let engine = test_engine();
        let (profile, result) = engine
            .profile(|e| {
                e.tidy(|e| {
                    let a = ops::ones(e, &[4])?;
                    let b = ops::ones(e, &[4])?;
                    ops::add(e, &a, &b)
                })
            })
            .unwrap();
        assert_eq!(engine.read_sync(&result).unwrap(), vec![2.0; 4]);
        assert!(profile.kernels.iter().any(|k| k.name == "Add"));
        assert_eq!(profile.new_tensors, 1);
        assert!(profile.to_json().unwrap().contains("Add"));
    }

    #[test]
    fn test_async_read_and_time() {
        let engine = test_engine();
        let t = ops::tensor(&engine, &[1.0, 2.0], &[2]).unwrap();
        let values = pollster::block_on(engine.read(&t)).unwrap();
        assert_eq!(values, vec![1.0, 2.0]);

        let timing = pollster::block_on(engine.time(|| {
            ops::ones(&engine, &[32]).map(|_| ())
        }))
        .unwrap();
        assert!(timing.wall_ms >= 0.0);
        assert!(timing.wall_ms >= timing.kernel_ms);
    }

    #[test]
    fn test_root_scope_is_resynthesized() {
        let engine = test_engine();
        engine.end_scope(&[], false).unwrap();
        assert_eq!(engine.state.borrow().scope_stack.len(), 1);
        // Allocation still works against the fresh root scope.
        let t = ops::scalar(&engine, 1.0).unwrap();
        assert_eq!(engine.read_sync(&t).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_memory_is_reliable_on_cpu() {
        let engine = test_engine();
        assert!(!engine.memory().unreliable);
    }

    #[test]
    fn test_debug_mode_does_not_alter_results() {
        let engine = Engine::new(
            Box::new(CpuBackend::new()),
            EngineConfig::default().with_debug(true),
        );
        let result = engine
            .tidy(|e| {
                let a = ops::tensor(e, &[1.0, -2.0], &[2])?;
                let b = ops::tensor(e, &[3.0, 4.0], &[2])?;
                ops::mul(e, &a, &b)
            })
            .unwrap();
        assert_eq!(engine.read_sync(&result).unwrap(), vec![3.0, -8.0]);
    }
}
