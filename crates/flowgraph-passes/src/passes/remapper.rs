//! Pattern-based op fusion.
//!
//! Rules:
//! - `MatMul|Conv2D → BiasAdd [→ Relu|Relu6|Elu]` → `_FusedMatMul` / `_FusedConv2D`
//! - `Mul(x, Sigmoid(x))` → `_MklSwish` (MKL only)
//! - `Mul(x, Tanh(Softplus(x)))` → `_MklFusedMish` (MKL only)

use crate::options::PassOptions;
use flowgraph_core::{
    Attribute, Module, NewOp, OpForm, OpId, OpRegistry, Pass, Result, ValueId,
};
use tracing::{debug, trace};

const ACTIVATIONS: &[&str] = &["Relu", "Relu6", "Elu"];

/// A matched chain and its replacement.
pub struct Fusion {
    /// Last op of the chain; its results are taken over by the fused op.
    pub root: OpId,

    /// Chain ops other than the root, all erased after fusion.
    pub interior: Vec<OpId>,

    /// The fused op (result types are filled from the root).
    pub replacement: NewOp,
}

/// A fusion rule.
pub trait RewriteRule: Send + Sync {
    /// Rule name for logging.
    fn name(&self) -> &str;

    /// Whether the rule targets MKL-specific kinds.
    fn requires_mkl(&self) -> bool {
        false
    }

    /// Try to match a chain ending at `root`.
    fn try_match(&self, module: &Module, root: OpId) -> Option<Fusion>;
}

/// Producer of `value` if it may be folded into a chain ending in `consumer`.
///
/// The producer must be plain, live in the consumer's region, have a single
/// result consumed exactly once (by `consumer`) and have no control
/// dependents.
fn fusible_producer(
    module: &Module,
    value: ValueId,
    consumer: OpId,
    kinds: &[&str],
) -> Option<OpId> {
    let v = module.value(value).ok()?;
    let producer = v.defining_op()?;
    let node = module.op(producer).ok()?;
    let consumer_node = module.op(consumer).ok()?;
    let ok = kinds.contains(&node.kind.as_str())
        && matches!(node.form(), OpForm::Plain)
        && node.parent() == consumer_node.parent()
        && node.results().len() == 1
        && v.users() == [consumer]
        && module.control_dependents(producer).is_empty();
    ok.then_some(producer)
}

/// Contraction followed by a bias add and an optional activation.
pub struct ContractionBiasActivation;

impl RewriteRule for ContractionBiasActivation {
    fn name(&self) -> &str {
        "contraction-bias-activation"
    }

    fn try_match(&self, module: &Module, root: OpId) -> Option<Fusion> {
        let node = module.op(root).ok()?;
        let (bias_add, activation) = if ACTIVATIONS.contains(&node.kind.as_str()) {
            let input = *node.operands().first()?;
            (fusible_producer(module, input, root, &["BiasAdd"])?, Some(root))
        } else if node.kind == "BiasAdd" {
            (root, None)
        } else {
            return None;
        };

        let bias_node = module.op(bias_add).ok()?;
        let [input, bias] = bias_node.operands() else {
            return None;
        };
        let contraction = fusible_producer(module, *input, bias_add, &["MatMul", "Conv2D"])?;
        let contraction_node = module.op(contraction).ok()?;
        let fused_kind = match contraction_node.kind.as_str() {
            "MatMul" => "_FusedMatMul",
            _ => "_FusedConv2D",
        };

        let mut fused_ops = vec!["BiasAdd".to_string()];
        if let Some(act) = activation {
            fused_ops.push(module.op(act).ok()?.kind.clone());
        }

        let mut attrs = contraction_node.attrs.clone();
        attrs.set("fused_ops", Attribute::Strings(fused_ops));
        attrs.set("num_args", 1i64);

        let mut interior = vec![contraction];
        if activation.is_some() {
            interior.push(bias_add);
        }

        Some(Fusion {
            root,
            interior,
            replacement: NewOp::new(fused_kind)
                .name(node.name.clone())
                .operands(contraction_node.operands().iter().copied().chain([*bias]))
                .attrs(attrs),
        })
    }
}

/// `x * sigmoid(x)`.
pub struct Swish;

impl RewriteRule for Swish {
    fn name(&self) -> &str {
        "swish"
    }

    fn requires_mkl(&self) -> bool {
        true
    }

    fn try_match(&self, module: &Module, root: OpId) -> Option<Fusion> {
        let node = module.op(root).ok()?;
        if node.kind != "Mul" {
            return None;
        }
        let [a, b] = node.operands() else {
            return None;
        };
        for (x, gate) in [(*a, *b), (*b, *a)] {
            let Some(sigmoid) = fusible_producer(module, gate, root, &["Sigmoid"]) else {
                continue;
            };
            if module.op(sigmoid).ok()?.operands() != [x] {
                continue;
            }
            let mut replacement = NewOp::new("_MklSwish").name(node.name.clone()).operands([x]);
            if let Some(t) = node.attrs.get("T") {
                replacement = replacement.attr("T", t.clone());
            }
            return Some(Fusion {
                root,
                interior: vec![sigmoid],
                replacement,
            });
        }
        None
    }
}

/// `x * tanh(softplus(x))`.
pub struct Mish;

impl RewriteRule for Mish {
    fn name(&self) -> &str {
        "mish"
    }

    fn requires_mkl(&self) -> bool {
        true
    }

    fn try_match(&self, module: &Module, root: OpId) -> Option<Fusion> {
        let node = module.op(root).ok()?;
        if node.kind != "Mul" {
            return None;
        }
        let [a, b] = node.operands() else {
            return None;
        };
        for (x, gate) in [(*a, *b), (*b, *a)] {
            let Some(tanh) = fusible_producer(module, gate, root, &["Tanh"]) else {
                continue;
            };
            let tanh_input = *module.op(tanh).ok()?.operands().first()?;
            let Some(softplus) = fusible_producer(module, tanh_input, tanh, &["Softplus"]) else {
                continue;
            };
            if module.op(softplus).ok()?.operands() != [x] {
                continue;
            }
            let mut replacement =
                NewOp::new("_MklFusedMish").name(node.name.clone()).operands([x]);
            if let Some(t) = node.attrs.get("T") {
                replacement = replacement.attr("T", t.clone());
            }
            return Some(Fusion {
                root,
                interior: vec![softplus, tanh],
                replacement,
            });
        }
        None
    }
}

/// Options for [`RemapperPass`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapperOptions {
    /// Enable rules producing MKL-specific kinds.
    pub enable_mkl_patterns: bool,
}

impl RemapperOptions {
    /// Read options from a by-name map.
    pub fn from_options(opts: &PassOptions) -> Result<Self> {
        opts.expect_only("remapper", &["enable-mkl-patterns"])?;
        Ok(Self {
            enable_mkl_patterns: opts.get_bool("enable-mkl-patterns")?.unwrap_or(false),
        })
    }
}

/// Pass that applies registered fusion rules.
pub struct RemapperPass {
    options: RemapperOptions,
    rules: Vec<Box<dyn RewriteRule>>,
}

impl RemapperPass {
    /// Create a remapper with the built-in rules.
    pub fn new(options: RemapperOptions) -> Self {
        let mut pass = Self {
            options,
            rules: Vec::new(),
        };
        pass.add_rule(ContractionBiasActivation)
            .add_rule(Swish)
            .add_rule(Mish);
        pass
    }

    /// Register an additional rule.
    pub fn add_rule(&mut self, rule: impl RewriteRule + 'static) -> &mut Self {
        self.rules.push(Box::new(rule));
        self
    }

    fn apply(module: &mut Module, fusion: Fusion) -> Result<()> {
        let Fusion {
            root,
            interior,
            replacement,
        } = fusion;

        let mut chain = interior.clone();
        chain.push(root);
        let mut control_deps = Vec::new();
        for &op in &chain {
            for &dep in module.op(op)?.control_deps() {
                if !chain.contains(&dep) && !control_deps.contains(&dep) {
                    control_deps.push(dep);
                }
            }
        }

        let root_node = module.op(root)?;
        let root_results = root_node.results().to_vec();
        let mut replacement = replacement;
        replacement.result_types = root_results
            .iter()
            .map(|&v| module.value_type(v).cloned())
            .collect::<Result<Vec<_>>>()?;
        replacement.control_deps = control_deps;

        let fused = module.insert_op_before(root, replacement)?;
        for (i, &old) in root_results.iter().enumerate() {
            let new = module.result(fused, i)?;
            module.replace_all_uses_with(old, new)?;
        }
        module.replace_control_dependent_edges(root, fused)?;

        module.erase_op(root)?;
        for &op in interior.iter().rev() {
            module.erase_op(op)?;
        }
        Ok(())
    }
}

impl Default for RemapperPass {
    fn default() -> Self {
        Self::new(RemapperOptions::default())
    }
}

impl Pass for RemapperPass {
    fn name(&self) -> &str {
        "remapper"
    }

    fn run(&self, module: &mut Module, _registry: &OpRegistry) -> Result<bool> {
        let mut fused = 0usize;

        // Later ops first so the longest chain wins.
        let mut ops = module.all_ops();
        ops.reverse();
        for op in ops {
            if !module.contains_op(op) {
                continue;
            }
            let matched = self
                .rules
                .iter()
                .filter(|rule| self.options.enable_mkl_patterns || !rule.requires_mkl())
                .find_map(|rule| rule.try_match(module, op).map(|f| (rule.name(), f)));
            if let Some((rule, fusion)) = matched {
                trace!(rule, root = module.op(op)?.display_name(), "fusing");
                Self::apply(module, fusion)?;
                fused += 1;
            }
        }

        debug!(fused, "remapper complete");
        Ok(fused > 0)
    }
}
