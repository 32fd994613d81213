mod common;

use bytes::Bytes;
use common::{logger, options, RecordingStateMachine, DEADLINE};
use consensus_node::{
    start_node, ClusterMembership, ConsensusNode, HubClient, HubConfig, HubError, HubServer, MemberConfig,
    NetworkConfig, NodeConfig, NodeId, ProposeError, Role, DEFAULT_HUB_CACHE_TTL, DEFAULT_HUB_CALL_TIMEOUT,
};
use std::collections::HashSet;
use std::error::Error;
use std::net::{SocketAddr, TcpListener};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

fn free_port() -> Result<u16, Box<dyn Error>> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

async fn start_grpc_node(
    id: u64,
    membership: ClusterMembership,
    hub: Option<HubConfig>,
) -> Result<(ConsensusNode, RecordingStateMachine), Box<dyn Error>> {
    let state_machine = RecordingStateMachine::default();
    let node = start_node(
        NodeConfig {
            node_id: NodeId::new(id),
            membership,
            data_dir: None,
            logger: logger(),
            options: options(),
        },
        Box::new(state_machine.clone()),
        NetworkConfig::Grpc { hub },
    )
    .await?;

    Ok((node, state_machine))
}

/// Keeps proposing through whichever node claims leadership until one proposal is accepted.
async fn propose_anywhere(nodes: &[ConsensusNode], data: &'static [u8]) -> Result<(), Box<dyn Error>> {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        for node in nodes {
            if node.status().await?.role != Role::Leader {
                continue;
            }
            match node.propose(Bytes::from_static(data)).await {
                Ok(_) => return Ok(()),
                Err(ProposeError::NotLeader(_)) | Err(ProposeError::NoLeader) => {}
                Err(e) => return Err(e.into()),
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Err("no leader accepted the proposal".into())
}

async fn wait_for_applied(state_machines: &[RecordingStateMachine], count: usize) -> Result<(), Box<dyn Error>> {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        if state_machines.iter().all(|sm| sm.len() >= count) {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    Err("entries were not applied everywhere in time".into())
}

#[tokio::test]
async fn three_nodes_replicate_over_grpc() -> Result<(), Box<dyn Error>> {
    let mut members = vec![];
    for id in 1..=3 {
        members.push(MemberConfig::with_address(id, "127.0.0.1", free_port()?));
    }
    let membership = ClusterMembership::new(members);

    let mut nodes = vec![];
    let mut state_machines = vec![];
    for id in 1..=3 {
        let (node, state_machine) = start_grpc_node(id, membership.clone(), None).await?;
        nodes.push(node);
        state_machines.push(state_machine);
    }

    propose_anywhere(&nodes, b"over the wire").await?;
    wait_for_applied(&state_machines, 1).await?;
    for state_machine in state_machines.iter() {
        assert_eq!(state_machine.applied_data(), vec![Bytes::from_static(b"over the wire")]);
    }

    for node in nodes {
        node.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn second_node_on_a_taken_port_fails_to_start() -> Result<(), Box<dyn Error>> {
    let taken = TcpListener::bind("127.0.0.1:0")?;
    let port = taken.local_addr()?.port();
    let membership = ClusterMembership::new(vec![MemberConfig::with_address(1, "127.0.0.1", port)]);

    match start_grpc_node(1, membership, None).await {
        Err(e) => assert!(e.to_string().contains("Can't listen"), "{}", e),
        Ok(_) => panic!("started on a port that's in use"),
    }
    Ok(())
}

#[tokio::test]
async fn nodes_find_each_other_through_the_hub() -> Result<(), Box<dyn Error>> {
    let hub_port = free_port()?;
    let hub_addr: SocketAddr = format!("127.0.0.1:{}", hub_port).parse()?;
    let (stop_hub, hub_stopped) = oneshot::channel::<()>();
    let hub = tokio::spawn(HubServer::new(logger()).run(hub_addr, async {
        let _ = hub_stopped.await;
    }));
    let hub_config = HubConfig {
        host: "127.0.0.1".into(),
        port: hub_port,
    };

    // Every node only knows its own address. Peers come from the hub.
    let ports = vec![free_port()?, free_port()?, free_port()?];
    let mut nodes = vec![];
    let mut state_machines = vec![];
    for id in 1..=3u64 {
        let members = (1..=3u64)
            .map(|member| {
                if member == id {
                    MemberConfig::with_address(member, "127.0.0.1", ports[(member - 1) as usize])
                } else {
                    MemberConfig::without_address(member)
                }
            })
            .collect();
        let (node, state_machine) =
            start_grpc_node(id, ClusterMembership::new(members), Some(hub_config.clone())).await?;
        nodes.push(node);
        state_machines.push(state_machine);
    }

    propose_anywhere(&nodes, b"discovered").await?;
    wait_for_applied(&state_machines, 1).await?;

    for node in nodes {
        node.shutdown().await;
    }
    let _ = stop_hub.send(());
    hub.await??;
    Ok(())
}

#[tokio::test]
async fn hub_client_registers_and_resolves() -> Result<(), Box<dyn Error>> {
    let hub_port = free_port()?;
    let hub_addr: SocketAddr = format!("127.0.0.1:{}", hub_port).parse()?;
    let (stop_hub, hub_stopped) = oneshot::channel::<()>();
    let hub = tokio::spawn(HubServer::new(logger()).run(hub_addr, async {
        let _ = hub_stopped.await;
    }));

    let client = HubClient::new(
        logger(),
        hub_addr.to_string(),
        DEFAULT_HUB_CACHE_TTL,
        DEFAULT_HUB_CALL_TIMEOUT,
    );

    // The server task may not be listening yet.
    let deadline = Instant::now() + DEADLINE;
    while let Err(e) = client.register(NodeId::new(7), "10.1.1.7:7000").await {
        assert!(Instant::now() < deadline, "hub never came up: {}", e);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(client.resolve(NodeId::new(7)).await?, "10.1.1.7:7000");
    assert!(matches!(
        client.resolve(NodeId::new(8)).await,
        Err(HubError::Unknown(id)) if id == NodeId::new(8)
    ));

    let _ = stop_hub.send(());
    hub.await??;
    Ok(())
}

#[tokio::test]
async fn proposals_through_the_hub_are_decided_and_reported() -> Result<(), Box<dyn Error>> {
    let hub_port = free_port()?;
    let hub_addr: SocketAddr = format!("127.0.0.1:{}", hub_port).parse()?;
    let (stop_hub, hub_stopped) = oneshot::channel::<()>();
    let hub_server = HubServer::new(logger());
    let hub = tokio::spawn(hub_server.clone().run(hub_addr, async {
        let _ = hub_stopped.await;
    }));
    let hub_config = HubConfig {
        host: "127.0.0.1".into(),
        port: hub_port,
    };

    let mut members = vec![];
    for id in 1..=3 {
        members.push(MemberConfig::with_address(id, "127.0.0.1", free_port()?));
    }
    let membership = ClusterMembership::new(members);
    let mut nodes = vec![];
    let mut state_machines = vec![];
    for id in 1..=3 {
        let (node, state_machine) = start_grpc_node(id, membership.clone(), Some(hub_config.clone())).await?;
        nodes.push(node);
        state_machines.push(state_machine);
    }

    // Retries cover the hub starting up, registrations and the first election.
    let client = HubClient::new(logger(), hub_addr.to_string(), DEFAULT_HUB_CACHE_TTL, DEFAULT_HUB_CALL_TIMEOUT);
    let deadline = Instant::now() + DEADLINE;
    let proposal = loop {
        match client.propose(Bytes::from_static(b"via hub")).await {
            Ok(proposal) => break proposal,
            Err(e) => assert!(Instant::now() < deadline, "hub never found a leader: {}", e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    assert_eq!(nodes[(proposal.node_id.as_u64() - 1) as usize].status().await?.role, Role::Leader);

    wait_for_applied(&state_machines, 1).await?;
    for state_machine in state_machines.iter() {
        assert_eq!(state_machine.applied_data(), vec![Bytes::from_static(b"via hub")]);
    }

    // Reports travel in the background.
    let mut waiting: HashSet<u64> = (1..=3).collect();
    while !waiting.is_empty() {
        assert!(Instant::now() < deadline, "no decision report from {:?}", waiting);
        waiting.retain(|id| {
            let reported = hub_server.decisions(NodeId::new(*id));
            let expected = (proposal.index.as_u64(), Bytes::from_static(b"via hub"));
            reported.first().map(|d| (d.index, d.data.clone())) != Some(expected)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for node in nodes {
        node.shutdown().await;
    }
    let _ = stop_hub.send(());
    hub.await??;
    Ok(())
}
