//! Binary contraction trees.
//!
//! A [`Linkage`] contracts two operands. Labels present in both are summed
//! over (internal); labels present in one survive (external). Trees nest:
//! either side may itself be an unpromoted linkage, while promoted linkages
//! (temporaries and scalars, carrying an id) behave as opaque leaves.

use crate::line::{join_labels, rename_lines, Line, Shape};
use crate::scaling::ScalingMap;
use crate::vertex::Vertex;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// A contraction of two vertices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Linkage {
    left: Vertex,
    right: Vertex,
    lines: Vec<Line>,
    internal: Vec<Line>,
    id: Option<usize>,
    flop_map: ScalingMap,
    mem_map: ScalingMap,
    signature: String,
}

/// Contract `left` with `right`.
///
/// Returns `None` when some label would occur more than twice.
pub fn compose(left: &Vertex, right: &Vertex) -> Option<Linkage> {
    let mut counts: IndexMap<&str, (&Line, usize)> = IndexMap::new();
    for line in left.lines().iter().chain(right.lines()) {
        counts.entry(line.label.as_str()).or_insert((line, 0)).1 += 1;
    }
    if counts.values().any(|&(_, n)| n > 2) {
        return None;
    }

    let lines: Vec<Line> = counts
        .values()
        .filter(|&&(_, n)| n == 1)
        .map(|&(l, _)| l.clone())
        .collect();
    let internal: Vec<Line> = counts
        .values()
        .filter(|&&(_, n)| n == 2)
        .map(|&(l, _)| l.clone())
        .collect();

    let mut flop_map = ScalingMap::new();
    let mut mem_map = ScalingMap::new();
    for child in [left, right] {
        if let Vertex::Linkage(l) = child {
            if l.id.is_none() {
                flop_map += &l.flop_map;
                mem_map += &l.mem_map;
            }
        }
    }
    flop_map.add_count(Shape::of(counts.values().map(|&(l, _)| l)), 1);
    mem_map.add_count(Shape::of(&lines), 1);

    let mut linkage = Linkage {
        left: left.clone(),
        right: right.clone(),
        lines,
        internal,
        id: None,
        flop_map,
        mem_map,
        signature: String::new(),
    };
    linkage.signature = linkage.compute_signature();
    Some(linkage)
}

impl Linkage {
    pub fn left(&self) -> &Vertex {
        &self.left
    }

    pub fn right(&self) -> &Vertex {
        &self.right
    }

    /// External lines, left operand first.
    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    /// Lines summed over at this step.
    pub fn internal_lines(&self) -> &[Line] {
        &self.internal
    }

    pub fn id(&self) -> Option<usize> {
        self.id
    }

    pub fn is_scalar(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn flop_map(&self) -> &ScalingMap {
        &self.flop_map
    }

    pub fn mem_map(&self) -> &ScalingMap {
        &self.mem_map
    }

    pub fn shape(&self) -> Shape {
        Shape::of(&self.lines)
    }

    /// Label-free structural key: operand identity, nesting, the
    /// connection pattern of internal lines and the class of each line.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// `tmps_{id}` / `scalars_{id}` once promoted, `contraction` before.
    pub fn name(&self) -> String {
        match self.id {
            Some(id) if self.is_scalar() => format!("scalars_{id}"),
            Some(id) => format!("tmps_{id}"),
            None => "contraction".to_string(),
        }
    }

    /// Copy promoted to intermediate `id`.
    pub fn with_id(&self, id: usize) -> Linkage {
        Linkage {
            id: Some(id),
            ..self.clone()
        }
    }

    /// Copy with the id dropped, exposing the tree for evaluation.
    pub fn unpromoted(&self) -> Linkage {
        Linkage {
            id: None,
            ..self.clone()
        }
    }

    /// Leaves of the tree; promoted nested linkages are leaves.
    pub fn leaves(&self) -> Vec<&Vertex> {
        let mut out = Vec::new();
        collect_leaves(&self.left, &mut out);
        collect_leaves(&self.right, &mut out);
        out
    }

    pub fn leaf_count(&self) -> usize {
        self.left.leaf_count() + self.right.leaf_count()
    }

    /// Relabel a line throughout the tree. Signature and costs are label
    /// independent and carry over.
    pub fn renamed(&self, from: &str, to: &str) -> Linkage {
        Linkage {
            left: self.left.renamed(from, to),
            right: self.right.renamed(from, to),
            lines: rename_lines(&self.lines, from, to),
            internal: rename_lines(&self.internal, from, to),
            ..self.clone()
        }
    }

    /// Copy of the tree in a label-independent layout, plus the number of
    /// line transpositions applied to its antisymmetric leaves.
    ///
    /// At every node the operand with the smaller structural key goes
    /// left. Inside each block of an antisymmetric leaf, lines are ordered
    /// by class, then external before internal, then by where the internal
    /// line leads. Two occurrences of one product that differ only in
    /// dummy labels or factor input order normalize to equal signatures;
    /// the parity of the transpositions must be folded into the sign of
    /// whatever holds the occurrence.
    pub fn normalized(&self) -> Option<(Linkage, usize)> {
        let external: HashSet<&str> = self.lines.iter().map(|l| l.label.as_str()).collect();
        let mut node = Node::Pair(Box::new(Node::of(&self.left)), Box::new(Node::of(&self.right)));
        node.orient(&external);

        let mut leaves = Vec::new();
        node.collect(&mut leaves);
        let swaps = order_leaf_lines(&mut leaves, &external);

        let tree = node.build(&mut leaves.into_iter())?;
        let linkage = tree.as_linkage()?.as_ref().clone();
        Some((Linkage { id: self.id, ..linkage }, swaps))
    }

    fn compute_signature(&self) -> String {
        let external: HashSet<&str> = self.lines.iter().map(|l| l.label.as_str()).collect();
        let mut ordinals: HashMap<&str, usize> = HashMap::new();
        let mut out = String::new();
        write_signature(&self.left, &self.right, &external, &mut ordinals, &mut out);
        out
    }
}

fn collect_leaves<'a>(vertex: &'a Vertex, out: &mut Vec<&'a Vertex>) {
    match vertex {
        Vertex::Linkage(l) if l.id.is_none() => {
            collect_leaves(&l.left, out);
            collect_leaves(&l.right, out);
        }
        _ => out.push(vertex),
    }
}

fn write_signature<'a>(
    left: &'a Vertex,
    right: &'a Vertex,
    external: &HashSet<&str>,
    ordinals: &mut HashMap<&'a str, usize>,
    out: &mut String,
) {
    out.push('(');
    write_operand(left, external, ordinals, out);
    out.push('*');
    write_operand(right, external, ordinals, out);
    out.push(')');
}

fn write_operand<'a>(
    vertex: &'a Vertex,
    external: &HashSet<&str>,
    ordinals: &mut HashMap<&'a str, usize>,
    out: &mut String,
) {
    if let Vertex::Linkage(l) = vertex {
        if l.id.is_none() {
            write_signature(&l.left, &l.right, external, ordinals, out);
            return;
        }
    }

    out.push_str(vertex.symbol().tag());
    out.push_str(&vertex.name());
    out.push('[');
    for (k, line) in vertex.lines().iter().enumerate() {
        if k > 0 {
            out.push(if k == vertex.n_bra() { '|' } else { ',' });
        }
        if external.contains(line.label.as_str()) {
            out.push(if line.occupied { 'O' } else { 'V' });
        } else {
            let next = ordinals.len();
            let ordinal = *ordinals.entry(line.label.as_str()).or_insert(next);
            out.push(if line.occupied { 'o' } else { 'v' });
            out.push_str(&ordinal.to_string());
        }
    }
    out.push(']');
}

fn is_antisymmetric(vertex: &Vertex) -> bool {
    vertex.as_tensor().is_some_and(|t| t.kind().is_antisymmetric())
}

/// Operand tree with leaves held by value while it is reshaped.
enum Node {
    Leaf(Vertex),
    Pair(Box<Node>, Box<Node>),
}

impl Node {
    fn of(vertex: &Vertex) -> Node {
        match vertex {
            Vertex::Linkage(l) if l.id.is_none() => {
                Node::Pair(Box::new(Node::of(&l.left)), Box::new(Node::of(&l.right)))
            }
            _ => Node::Leaf(vertex.clone()),
        }
    }

    /// Swap operands so the smaller key is on the left; returns the key of
    /// the reshaped subtree.
    fn orient(&mut self, external: &HashSet<&str>) -> String {
        match self {
            Node::Leaf(v) => leaf_key(v, external),
            Node::Pair(left, right) => {
                let kl = left.orient(external);
                let kr = right.orient(external);
                if kr < kl {
                    std::mem::swap(left, right);
                    format!("({kr}*{kl})")
                } else {
                    format!("({kl}*{kr})")
                }
            }
        }
    }

    fn collect(&self, out: &mut Vec<Vertex>) {
        match self {
            Node::Leaf(v) => out.push(v.clone()),
            Node::Pair(left, right) => {
                left.collect(out);
                right.collect(out);
            }
        }
    }

    fn build(&self, leaves: &mut impl Iterator<Item = Vertex>) -> Option<Vertex> {
        match self {
            Node::Leaf(_) => leaves.next(),
            Node::Pair(left, right) => {
                let l = left.build(leaves)?;
                let r = right.build(leaves)?;
                compose(&l, &r).map(|c| Vertex::Linkage(Arc::new(c)))
            }
        }
    }
}

/// Operand name plus the classes and roles of its lines. Blocks of
/// antisymmetric tensors are treated as unordered.
fn leaf_key(vertex: &Vertex, external: &HashSet<&str>) -> String {
    let token = |l: &Line| match (external.contains(l.label.as_str()), l.occupied) {
        (true, true) => 'O',
        (true, false) => 'V',
        (false, true) => 'o',
        (false, false) => 'v',
    };
    let block = |lines: &[Line]| {
        let mut tokens: Vec<char> = lines.iter().map(&token).collect();
        if is_antisymmetric(vertex) {
            tokens.sort_unstable();
        }
        tokens.into_iter().collect::<String>()
    };
    let (bra, ket) = vertex.lines().split_at(vertex.n_bra());
    format!("{}{}[{}|{}]", vertex.symbol().tag(), vertex.name(), block(bra), block(ket))
}

/// (virtual, role, a, b, c): external lines have role 0; internal lines
/// already numbered by an earlier leaf have role 1 and `a` = ordinal;
/// the rest have role 2 and point at the partner leaf, its block and, for
/// a partner with fixed line order, the partner position.
type LineKey = (bool, u8, usize, usize, usize);

/// Reorder each block of every antisymmetric leaf by [`LineKey`]; returns
/// the number of transpositions.
fn order_leaf_lines(leaves: &mut [Vertex], external: &HashSet<&str>) -> usize {
    let mut sites: HashMap<String, Vec<(usize, usize)>> = HashMap::new();
    for (k, leaf) in leaves.iter().enumerate() {
        for (p, line) in leaf.lines().iter().enumerate() {
            sites.entry(line.label.clone()).or_default().push((k, p));
        }
    }

    let mut ordinals: HashMap<String, usize> = HashMap::new();
    let mut swaps = 0;
    for k in 0..leaves.len() {
        if is_antisymmetric(&leaves[k]) {
            let keys: Vec<LineKey> = leaves[k]
                .lines()
                .iter()
                .enumerate()
                .map(|(p, line)| {
                    let class = !line.occupied;
                    if external.contains(line.label.as_str()) {
                        return (class, 0, 0, 0, 0);
                    }
                    if let Some(&ordinal) = ordinals.get(&line.label) {
                        return (class, 1, ordinal, 0, 0);
                    }
                    let (m, q) = sites
                        .get(&line.label)
                        .and_then(|s| s.iter().copied().find(|&site| site != (k, p)))
                        .unwrap_or((k, p));
                    let partner = &leaves[m];
                    let block = usize::from(q >= partner.n_bra());
                    let position = if is_antisymmetric(partner) { 0 } else { q };
                    (class, 2, m, block, position)
                })
                .collect();

            let mut order: Vec<usize> = (0..keys.len()).collect();
            let (bra, ket) = order.split_at_mut(leaves[k].n_bra());
            swaps += sort_positions(bra, &keys) + sort_positions(ket, &keys);
            let lines = order.iter().map(|&p| leaves[k].lines()[p].clone()).collect();
            leaves[k] = leaves[k].with_lines(lines);
        }
        for line in leaves[k].lines() {
            if !external.contains(line.label.as_str()) {
                let next = ordinals.len();
                ordinals.entry(line.label.clone()).or_insert(next);
            }
        }
    }
    swaps
}

/// Stable insertion sort of positions by key, counting transpositions.
fn sort_positions(block: &mut [usize], keys: &[LineKey]) -> usize {
    let mut swaps = 0;
    for i in 1..block.len() {
        let mut j = i;
        while j > 0 && keys[block[j - 1]] > keys[block[j]] {
            block.swap(j - 1, j);
            swaps += 1;
            j -= 1;
        }
    }
    swaps
}

impl fmt::Display for Linkage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.id.is_some() {
            return write!(f, "{}({})", self.name(), join_labels(&self.lines));
        }
        let leaves: Vec<String> = self.leaves().iter().map(|v| v.to_string()).collect();
        f.write_str(&leaves.join(" "))
    }
}

/// Enumerates the binary contraction trees over subsets of a factor list.
///
/// Subsets are bitmasks over `factors`; results are memoized so that every
/// subtree is built once per term.
pub(crate) struct TreeEnumerator<'a> {
    factors: &'a [Vertex],
    memo: HashMap<u32, Vec<Vertex>>,
}

/// Factor lists longer than this are not enumerated.
pub(crate) const MAX_ENUMERATED_FACTORS: usize = 16;

impl<'a> TreeEnumerator<'a> {
    pub fn new(factors: &'a [Vertex]) -> Self {
        Self {
            factors,
            memo: HashMap::new(),
        }
    }

    /// Every connected tree over the factors selected by `mask`.
    pub fn trees(&mut self, mask: u32) -> Vec<Vertex> {
        if mask.count_ones() == 1 {
            return vec![self.factors[mask.trailing_zeros() as usize].clone()];
        }
        if let Some(found) = self.memo.get(&mask) {
            return found.clone();
        }

        let low = mask & mask.wrapping_neg();
        let rest = mask ^ low;
        let mut out = Vec::new();
        let mut sub = rest;
        loop {
            let left_mask = low | sub;
            let right_mask = mask ^ left_mask;
            if right_mask != 0 {
                let lefts = self.trees(left_mask);
                let rights = self.trees(right_mask);
                for l in &lefts {
                    for r in &rights {
                        if !connected(l, r) {
                            continue;
                        }
                        if let Some(linkage) = compose(l, r) {
                            out.push(Vertex::Linkage(Arc::new(linkage)));
                        }
                    }
                }
            }
            if sub == 0 {
                break;
            }
            sub = (sub - 1) & rest;
        }

        self.memo.insert(mask, out.clone());
        out
    }
}

/// Operands share a label, or one of them carries no lines.
fn connected(a: &Vertex, b: &Vertex) -> bool {
    a.rank() == 0
        || b.rank() == 0
        || a
            .lines()
            .iter()
            .any(|x| b.lines().iter().any(|y| x.label == y.label))
}

/// Factor lists longer than this are ordered greedily.
pub(crate) const MAX_ORDERED_FACTORS: usize = 10;

/// Contraction tree over all of `factors` with the lowest flop map under
/// [`ScalingMap::cost_cmp`]. Exact for connected products of up to
/// [`MAX_ORDERED_FACTORS`] factors, greedy otherwise.
pub(crate) fn contraction_tree(factors: &[Vertex]) -> Option<Vertex> {
    let n = factors.len();
    if n < 2 {
        return None;
    }
    if n <= MAX_ORDERED_FACTORS {
        let mut memo = HashMap::new();
        if let Some(tree) = cheapest(factors, (1u32 << n) - 1, &mut memo) {
            return Some(tree);
        }
    }
    greedy_tree(factors)
}

/// Best tree per subset. Step costs depend only on the subset's lines, so
/// the cheapest tree is built from the cheapest subtrees.
fn cheapest(factors: &[Vertex], mask: u32, memo: &mut HashMap<u32, Option<Vertex>>) -> Option<Vertex> {
    if mask.count_ones() == 1 {
        return Some(factors[mask.trailing_zeros() as usize].clone());
    }
    if let Some(found) = memo.get(&mask) {
        return found.clone();
    }

    let low = mask & mask.wrapping_neg();
    let rest = mask ^ low;
    let mut best: Option<Linkage> = None;
    let mut sub = rest;
    loop {
        let left_mask = low | sub;
        let right_mask = mask ^ left_mask;
        if right_mask != 0 {
            let left = cheapest(factors, left_mask, memo);
            let right = cheapest(factors, right_mask, memo);
            if let (Some(l), Some(r)) = (left, right) {
                if let Some(c) = compose(&l, &r).filter(|_| connected(&l, &r)) {
                    if best.as_ref().map_or(true, |b| c.flop_map.cost_cmp(&b.flop_map).is_lt()) {
                        best = Some(c);
                    }
                }
            }
        }
        if sub == 0 {
            break;
        }
        sub = (sub - 1) & rest;
    }

    let out = best.map(|l| Vertex::Linkage(Arc::new(l)));
    memo.insert(mask, out.clone());
    out
}

/// Repeatedly join the connected pair with the cheapest result; operands
/// left with no connection are joined in list order.
fn greedy_tree(factors: &[Vertex]) -> Option<Vertex> {
    let mut pool = factors.to_vec();
    while pool.len() > 1 {
        let mut best: Option<(usize, usize, Linkage)> = None;
        for i in 0..pool.len() {
            for j in i + 1..pool.len() {
                if !connected(&pool[i], &pool[j]) {
                    continue;
                }
                let Some(c) = compose(&pool[i], &pool[j]) else {
                    continue;
                };
                if best
                    .as_ref()
                    .map_or(true, |(_, _, b)| c.flop_map.cost_cmp(&b.flop_map).is_lt())
                {
                    best = Some((i, j, c));
                }
            }
        }
        let (i, j, joined) = match best {
            Some(found) => found,
            None => (0, 1, compose(&pool[0], &pool[1])?),
        };
        pool.remove(j);
        pool[i] = Vertex::Linkage(Arc::new(joined));
    }
    pool.pop()
}
