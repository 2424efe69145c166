//! Whole-network save and load.
//!
//! A network is written as `NWRK { LYRS { <layer>* } OUTP { TYPE LAST } }`.
//! Layers are stored in ascending node order of everything reachable from the
//! terminal node, and every link is the 1-based position of its target in
//! that order. Loading reads all layers first and resolves the links once the
//! full list exists.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{NetError, Result};
use crate::layers::{Layer, LinkIndex, NodeId};
use crate::loss::{OutputLayer, OutputType};
use crate::network::config::Hyperparams;
use crate::network::graph::{resolve_link, Graph};
use crate::serial::{required, tag, Chunk, ChunkWriter, Dispatch};

/// Node id → 1-based save position.
struct SaveOrder(HashMap<NodeId, i32>);

impl LinkIndex for SaveOrder {
    fn index_of(&self, id: NodeId) -> Result<i32> {
        self.0
            .get(&id)
            .copied()
            .ok_or_else(|| NetError::format(format!("node {id} is not part of the saved network")))
    }
}

pub fn save_graph(graph: &Graph, output: &OutputLayer) -> Result<Vec<u8>> {
    let nodes = graph.gather(output.last())?;
    let mut order = HashMap::with_capacity(nodes.len());
    for (pos, &id) in nodes.iter().enumerate() {
        let index = i32::try_from(pos + 1)
            .map_err(|_| NetError::format("too many nodes for a 32-bit index"))?;
        order.insert(id, index);
    }
    let order = SaveOrder(order);

    let mut w = ChunkWriter::new();
    w.begin(tag::NWRK);
    w.begin(tag::LYRS);
    for &id in &nodes {
        graph.layer(id)?.save(&mut w, graph.name(id), &order)?;
    }
    w.end()?;
    w.begin(tag::OUTP);
    w.write_i32(tag::TYPE, output.kind().code())?;
    w.write_i32(tag::LAST, order.index_of(output.last())?)?;
    w.end()?;
    w.end()?;
    let bytes = w.finish()?;
    debug!(nodes = nodes.len(), bytes = bytes.len(), "serialized network");
    Ok(bytes)
}

pub fn load_graph(data: &[u8], defaults: Hyperparams) -> Result<(Graph, OutputLayer)> {
    let root = Chunk::root(data, tag::NWRK)?;
    let mut loaded = Vec::new();
    let mut layers_seen = false;
    let mut kind = None;
    let mut last = None;

    Dispatch::new()
        .on(tag::LYRS, |c| {
            layers_seen = true;
            Dispatch::new()
                .on_any(|_, child| {
                    loaded.push(Layer::load(child)?);
                    Ok(())
                })
                .execute(c)
        })
        .on(tag::OUTP, |c| {
            Dispatch::new()
                .on(tag::TYPE, |f| {
                    kind = Some(OutputType::from_code(f.read_i32()?)?);
                    Ok(())
                })
                .on(tag::LAST, |f| {
                    last = Some(f.read_i32()?);
                    Ok(())
                })
                .execute(c)
        })
        .execute(root)?;

    if !layers_seen {
        return Err(NetError::format(format!("{} chunk is missing {}", tag::NWRK, tag::LYRS)));
    }
    let kind = required(kind, tag::OUTP, tag::TYPE)?;
    let last = required(last, tag::OUTP, tag::LAST)?;
    debug!(layers = loaded.len(), "read layer chunks");

    let len = loaded.len();
    let graph = Graph::from_loaded(loaded, defaults)?;
    let last = resolve_link(last, len)?;
    Ok((graph, OutputLayer::new(last, kind)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::Activation;

    fn small() -> (Graph, OutputLayer) {
        let mut g = Graph::new();
        let x = g.input(2);
        let h = g.dense(x, 3, Activation::Tanh).unwrap();
        let y = g.dense(h, 1, Activation::Linear).unwrap();
        g.set_name(h, "hidden").unwrap();
        (g, OutputLayer::new(y, OutputType::MeanSquare))
    }

    #[test]
    fn layout_starts_with_network_and_layers() {
        let (g, out) = small();
        let bytes = save_graph(&g, &out).unwrap();
        assert_eq!(&bytes[0..4], b"NWRK");
        assert_eq!(&bytes[8..12], b"LYRS");
        assert_eq!(&bytes[16..20], b"INPT");
    }

    #[test]
    fn unreachable_nodes_are_not_saved() {
        let (mut g, out) = small();
        let h = g.find("hidden").unwrap();
        g.dense(h, 7, Activation::ReLU).unwrap();
        let bytes = save_graph(&g, &out).unwrap();
        let (loaded, loaded_out) = load_graph(&bytes, Hyperparams::default()).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded_out.last(), NodeId(2));
        assert_eq!(loaded.find("hidden"), Some(NodeId(1)));
    }

    #[test]
    fn unknown_layer_kind_is_rejected() {
        let mut w = ChunkWriter::new();
        w.begin(tag::NWRK);
        w.begin(tag::LYRS);
        w.begin(crate::serial::Tag::new(b"CONV"));
        w.end().unwrap();
        w.end().unwrap();
        w.end().unwrap();
        let bytes = w.finish().unwrap();
        assert!(matches!(
            load_graph(&bytes, Hyperparams::default()),
            Err(NetError::Format(_))
        ));
    }
}
