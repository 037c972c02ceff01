//! Array-backed combining tree.
//!
//! Nodes are stored breadth first with the root at index 0, so a forward walk
//! visits parents before children and a slice of the last level is the set of
//! leaves. Each leaf covers up to `leaf_fanout` processors, each interior node
//! up to `interior_fanout` children.
//!
//! 基于数组的合并树。
//! 节点按广度优先顺序存储，根节点位于下标 0，因此正向遍历总是先访问父节点再访问子节点，
//! 最后一层的切片就是全部叶节点。每个叶节点最多覆盖 `leaf_fanout` 个处理器，
//! 每个内部节点最多有 `interior_fanout` 个子节点。

use crate::sync::{AtomicBool, AtomicUsize, Mutex, MutexGuard, Ordering};
use std::ops::{Deref, DerefMut, Range};

/// Fields only ever touched with the node lock held.
/// 只在持有节点锁时访问的字段。
#[derive(Debug, Default)]
pub(crate) struct NodeLocked {
    /// Children online at the start of the current grace period.
    /// 当前宽限期开始时在线的子节点。
    pub(crate) qsmaskinit: usize,
    /// Last grace period this node finished reporting for.
    /// 本节点最近一次完成报告的宽限期。
    pub(crate) completedqs: usize,
}

/// One node of the combining tree.
///
/// The atomics are written only with `lock` held and may be read without it
/// as hints; anything that acts on them re-reads under the lock.
///
/// 合并树中的一个节点。
/// 原子字段只在持有 `lock` 时写入，可以在不持锁时作为提示读取；
/// 任何基于它们的操作都会在持锁后重新读取。
#[repr(align(64))]
pub(crate) struct Node {
    lock: Mutex<NodeLocked>,
    /// Children that still owe a quiescent state this grace period.
    /// 本宽限期内仍欠静止状态的子节点。
    qsmask: AtomicUsize,
    /// Children currently online; folded into `qsmaskinit` at grace-period start.
    /// 当前在线的子节点；在宽限期开始时合入 `qsmaskinit`。
    qsmaskinitnext: AtomicUsize,
    /// Processors of this leaf that are flooded with callbacks.
    /// 本叶节点中被回调淹没的处理器。
    cbovldmask: AtomicUsize,
    gp_seq: AtomicUsize,
    gp_seq_needed: AtomicUsize,
    /// Funnel try-lock for `force_quiescent_state`.
    /// `force_quiescent_state` 使用的漏斗式尝试锁。
    pub(crate) fqs_lock: AtomicBool,
    pub(crate) index: usize,
    pub(crate) parent: Option<usize>,
    /// This node's bit in its parent's masks.
    /// 本节点在父节点掩码中的位。
    pub(crate) grpmask: usize,
    pub(crate) grplo: usize,
    pub(crate) grphi: usize,
    pub(crate) level: usize,
    pub(crate) is_leaf: bool,
}

impl Node {
    #[inline]
    pub(crate) fn lock(&self) -> NodeGuard<'_> {
        NodeGuard {
            node: self,
            locked: self.lock.lock(),
        }
    }

    #[inline]
    pub(crate) fn gp_seq(&self) -> usize {
        self.gp_seq.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn gp_seq_needed(&self) -> usize {
        self.gp_seq_needed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn qsmask(&self) -> usize {
        self.qsmask.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn qsmaskinitnext(&self) -> usize {
        self.qsmaskinitnext.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn cbovldmask(&self) -> usize {
        self.cbovldmask.load(Ordering::Acquire)
    }

    /// Processor ids covered by this node.
    #[inline]
    pub(crate) fn cpus(&self) -> Range<usize> {
        self.grplo..self.grphi + 1
    }

    /// Processors of this leaf selected by `mask`.
    /// 本叶节点中被 `mask` 选中的处理器。
    pub(crate) fn cpus_in(&self, mask: usize) -> impl Iterator<Item = usize> + '_ {
        self.cpus()
            .filter(move |cpu| mask & (1usize << (cpu - self.grplo)) != 0)
    }
}

/// Lock guard of a [`Node`], giving write access to its lock-protected atomics.
/// [`Node`] 的锁守卫，提供对其受锁保护的原子字段的写访问。
pub(crate) struct NodeGuard<'a> {
    pub(crate) node: &'a Node,
    locked: MutexGuard<'a, NodeLocked>,
}

impl NodeGuard<'_> {
    #[inline]
    pub(crate) fn qsmask(&self) -> usize {
        self.node.qsmask.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_qsmask(&mut self, mask: usize) {
        self.node.qsmask.store(mask, Ordering::Release);
    }

    #[inline]
    pub(crate) fn qsmaskinitnext(&self) -> usize {
        self.node.qsmaskinitnext.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_qsmaskinitnext(&mut self, mask: usize) {
        self.node.qsmaskinitnext.store(mask, Ordering::Release);
    }

    #[inline]
    pub(crate) fn cbovldmask(&self) -> usize {
        self.node.cbovldmask.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_cbovldmask(&mut self, mask: usize) {
        self.node.cbovldmask.store(mask, Ordering::Release);
    }

    #[inline]
    pub(crate) fn gp_seq(&self) -> usize {
        self.node.gp_seq.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_gp_seq(&mut self, seq: usize) {
        self.node.gp_seq.store(seq, Ordering::Release);
    }

    #[inline]
    pub(crate) fn gp_seq_needed(&self) -> usize {
        self.node.gp_seq_needed.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_gp_seq_needed(&mut self, seq: usize) {
        self.node.gp_seq_needed.store(seq, Ordering::Release);
    }
}

impl Deref for NodeGuard<'_> {
    type Target = NodeLocked;

    fn deref(&self) -> &NodeLocked {
        &self.locked
    }
}

impl DerefMut for NodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut NodeLocked {
        &mut self.locked
    }
}

/// The combining tree, sized once from the processor count.
/// 合并树，根据处理器数量一次性确定规模。
pub(crate) struct Tree {
    nodes: Box<[Node]>,
    levels: Vec<Range<usize>>,
    leaf_fanout: usize,
}

impl Tree {
    pub(crate) fn new(
        processors: usize,
        leaf_fanout: usize,
        interior_fanout: usize,
        gp_seq: usize,
    ) -> Self {
        // Node count per level, leaves first.
        let mut counts = vec![processors.div_ceil(leaf_fanout)];
        while let Some(&last) = counts.last() {
            if last <= 1 {
                break;
            }
            counts.push(last.div_ceil(interior_fanout));
        }
        counts.reverse();

        let mut levels = Vec::with_capacity(counts.len());
        let mut start = 0;
        for &count in &counts {
            levels.push(start..start + count);
            start += count;
        }

        let depth = counts.len();
        let mut nodes = Vec::with_capacity(start);
        for (level, range) in levels.iter().enumerate() {
            // Processors spanned by one node at this level.
            let span = (level + 1..depth)
                .fold(leaf_fanout, |span, _| span.saturating_mul(interior_fanout));
            for k in 0..range.len() {
                let (parent, grpmask) = if level == 0 {
                    (None, 0)
                } else {
                    let parent = levels[level - 1].start + k / interior_fanout;
                    (Some(parent), 1usize << (k % interior_fanout))
                };
                let grplo = k.saturating_mul(span);
                let grphi = grplo.saturating_add(span).min(processors) - 1;
                nodes.push(Node {
                    lock: Mutex::new(NodeLocked {
                        qsmaskinit: 0,
                        completedqs: gp_seq,
                    }),
                    qsmask: AtomicUsize::new(0),
                    qsmaskinitnext: AtomicUsize::new(0),
                    cbovldmask: AtomicUsize::new(0),
                    gp_seq: AtomicUsize::new(gp_seq),
                    gp_seq_needed: AtomicUsize::new(gp_seq),
                    fqs_lock: AtomicBool::new(false),
                    index: range.start + k,
                    parent,
                    grpmask,
                    grplo,
                    grphi,
                    level,
                    is_leaf: level + 1 == depth,
                });
            }
        }

        log::debug!(
            "combining tree for {processors} processors: {} nodes in {depth} levels {:?}",
            nodes.len(),
            counts
        );

        Self {
            nodes: nodes.into_boxed_slice(),
            levels,
            leaf_fanout,
        }
    }

    #[inline]
    pub(crate) fn root(&self) -> &Node {
        &self.nodes[0]
    }

    #[inline]
    pub(crate) fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    #[inline]
    pub(crate) fn parent(&self, node: &Node) -> Option<&Node> {
        node.parent.map(|p| &self.nodes[p])
    }

    /// All nodes, parents before children.
    /// 全部节点，父节点先于子节点。
    #[inline]
    pub(crate) fn breadth_first(&self) -> &[Node] {
        &self.nodes
    }

    #[inline]
    pub(crate) fn leaves(&self) -> &[Node] {
        let last = &self.levels[self.levels.len() - 1];
        &self.nodes[last.clone()]
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.levels.len()
    }

    /// Index of the leaf covering `cpu`.
    #[inline]
    pub(crate) fn leaf_of(&self, cpu: usize) -> usize {
        self.levels[self.levels.len() - 1].start + cpu / self.leaf_fanout
    }

    /// Bit of `cpu` within its leaf's masks.
    #[inline]
    pub(crate) fn cpu_grpmask(&self, cpu: usize) -> usize {
        1usize << (cpu % self.leaf_fanout)
    }

    /// A leaf gained its first online processor: make every ancestor that
    /// lost track of this branch wait on it again from the next grace period.
    ///
    /// The caller holds `leaf`'s lock; ancestors are locked one at a time.
    ///
    /// 叶节点获得了第一个在线处理器：让所有不再跟踪该分支的祖先从下一个宽限期起重新等待它。
    /// 调用者持有 `leaf` 的锁；祖先节点逐个加锁。
    pub(crate) fn init_new_leaf(&self, leaf: &Node) {
        let mut child = leaf;
        while let Some(parent) = self.parent(child) {
            let mut guard = parent.lock();
            let oldmask = guard.qsmaskinit;
            guard.qsmaskinit |= child.grpmask;
            if oldmask != 0 {
                return;
            }
            child = parent;
        }
    }

    /// A leaf lost its last online processor: remove the branch from every
    /// ancestor that has no other online children.
    ///
    /// 叶节点失去了最后一个在线处理器：从所有没有其他在线子节点的祖先中移除该分支。
    pub(crate) fn cleanup_dead_leaf(&self, leaf: &Node) {
        let mut child = leaf;
        while let Some(parent) = self.parent(child) {
            let mut guard = parent.lock();
            guard.qsmaskinit &= !child.grpmask;
            debug_assert!(
                guard.qsmask() & child.grpmask == 0,
                "BUG: node {} still owes a quiescent state for a dead branch",
                parent.index
            );
            if guard.qsmaskinit != 0 {
                return;
            }
            child = parent;
        }
    }
}
