//! `CLUSTER NODES` reply parsing.
//!
//! Each line reads
//! `<id> <ip:port@cport[,hostname]> <flags> <master> <ping> <pong> <epoch> <link> <slots...>`.
//! Only healthy masters serve keys, so replicas and failed or handshaking
//! nodes are dropped.

use shardstate_common::NodeAddress;

/// Master addresses from a `CLUSTER NODES` reply, sorted and deduplicated.
/// Lines that do not parse are skipped.
pub fn parse_cluster_nodes(reply: &str) -> Vec<NodeAddress> {
    let mut nodes: Vec<NodeAddress> = reply
        .lines()
        .filter_map(parse_line)
        .collect();
    nodes.sort();
    nodes.dedup();
    nodes
}

fn parse_line(line: &str) -> Option<NodeAddress> {
    let mut parts = line.split_whitespace();
    let _id = parts.next()?;
    let addr = parts.next()?;
    let flags = parts.next()?;

    let flags: Vec<&str> = flags.split(',').collect();
    if !flags.contains(&"master") {
        return None;
    }
    if flags
        .iter()
        .any(|f| matches!(*f, "fail" | "fail?" | "handshake" | "noaddr"))
    {
        return None;
    }

    // Strip the cluster bus port and optional hostname.
    let addr = addr.split(',').next()?;
    let addr = addr.split('@').next()?;
    addr.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master - 0 1426238318243 3 connected 10923-16383
6ec23923021cf3ffec47632106199cb7f496ce01 127.0.0.1:30005@31005 slave 67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 0 1426238316232 5 connected
824fe116063bc5fcf9f4ffd895bc17aee7731ac3 127.0.0.1:30006@31006 slave 292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 0 1426238317741 6 connected
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001,node-1.local myself,master - 0 0 1 connected 0-5460
";

    #[test]
    fn test_masters_only() {
        let nodes = parse_cluster_nodes(REPLY);
        let ports: Vec<u16> = nodes.iter().map(|n| n.port).collect();
        assert_eq!(ports, vec![30001, 30002, 30003]);
        assert!(nodes.iter().all(|n| n.host == "127.0.0.1"));
    }

    #[test]
    fn test_failed_and_handshake_nodes_skipped() {
        let reply = "\
a 10.0.0.1:7000@17000 master - 0 0 1 connected 0-8000
b 10.0.0.2:7000@17000 master,fail - 0 0 2 disconnected 8001-16383
c :0@0 master,noaddr - 0 0 3 disconnected
d 10.0.0.4:7000@17000 handshake - 0 0 0 connected
";
        assert_eq!(
            parse_cluster_nodes(reply),
            vec![NodeAddress::new("10.0.0.1", 7000)]
        );
    }

    #[test]
    fn test_garbage_lines_ignored() {
        assert!(parse_cluster_nodes("").is_empty());
        assert!(parse_cluster_nodes("not a cluster reply\n\n").is_empty());
    }
}
