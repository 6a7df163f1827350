use serde::{Deserialize, Serialize};

/// VM runtimes a call chain may pass through.
///
/// The discriminants are part of the wire format: runtime `t` owns bit
/// `1 << (59 - t)` of [`CrossContext::cross_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeType {
    Invalid = 0,
    Native = 1,
    Wasmer = 2,
    Wxvm = 3,
    Gasm = 4,
    Evm = 5,
    DockerGo = 6,
    Java = 7,
    Go = 8,
}

impl RuntimeType {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeType::Invalid => "invalid",
            RuntimeType::Native => "native",
            RuntimeType::Wasmer => "wasmer",
            RuntimeType::Wxvm => "wxvm",
            RuntimeType::Gasm => "gasm",
            RuntimeType::Evm => "evm",
            RuntimeType::DockerGo => "docker-go",
            RuntimeType::Java => "java",
            RuntimeType::Go => "go",
        }
    }

    pub fn bit(self) -> u64 {
        1u64 << (59 - self as u32)
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a message inside a cross-contract call chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossContext {
    pub current_depth: u32,
    /// Bitmap of the runtimes already visited along the chain.
    pub cross_info: u64,
}

impl CrossContext {
    pub fn original(runtime: RuntimeType) -> Self {
        CrossContext {
            current_depth: 0,
            cross_info: runtime.bit(),
        }
    }

    pub fn has_used(&self, runtime: RuntimeType) -> bool {
        self.cross_info & runtime.bit() != 0
    }

    pub fn is_cross_call(&self) -> bool {
        self.current_depth > 0
    }

    /// Context of a call issued one level below `self` into `callee`.
    pub fn descend(&self, callee: RuntimeType) -> Self {
        CrossContext {
            current_depth: self.current_depth.saturating_add(1),
            cross_info: self.cross_info | callee.bit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_bits_do_not_overlap() {
        let all = [
            RuntimeType::Invalid,
            RuntimeType::Native,
            RuntimeType::Wasmer,
            RuntimeType::Wxvm,
            RuntimeType::Gasm,
            RuntimeType::Evm,
            RuntimeType::DockerGo,
            RuntimeType::Java,
            RuntimeType::Go,
        ];
        let mut seen = 0u64;
        for rt in all {
            assert_eq!(seen & rt.bit(), 0, "bit collision for {rt}");
            seen |= rt.bit();
        }
        assert_eq!(RuntimeType::Go.bit(), 1u64 << 51);
    }

    #[test]
    fn descend_marks_callee_and_increments_depth() {
        let root = CrossContext::original(RuntimeType::Go);
        assert!(root.has_used(RuntimeType::Go));
        assert!(!root.has_used(RuntimeType::Evm));
        assert!(!root.is_cross_call());

        let child = root.descend(RuntimeType::Evm);
        assert_eq!(child.current_depth, 1);
        assert!(child.has_used(RuntimeType::Go));
        assert!(child.has_used(RuntimeType::Evm));
        assert!(child.is_cross_call());
    }
}
