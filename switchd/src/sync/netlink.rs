// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Reads the kernel's rtnetlink notifications and turns them into sync events.

use std::net::Ipv4Addr;

use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::address::AddressMessage;
use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
use netlink_packet_route::neighbour::{
    NeighbourAddress, NeighbourAttribute, NeighbourMessage,
};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteMessage, RouteType,
};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};
use slog::{debug, error, info, o, trace, warn};
use tokio::sync::mpsc;

use super::{Event, Op};
use crate::route;
use crate::types::{SwdError, SwdResult};
use common::network::MacAddr;

// Multicast groups from linux/rtnetlink.h
const RTMGRP_LINK: u32 = 0x1;
const RTMGRP_NEIGH: u32 = 0x4;
const RTMGRP_IPV4_IFADDR: u32 = 0x10;
const RTMGRP_IPV4_ROUTE: u32 = 0x40;

fn link_events(msg: &LinkMessage, op: Op) -> Vec<Event> {
    let ifindex = msg.header.index;
    if op == Op::Removed {
        return vec![Event::LinkRemoved { ifindex }];
    }
    msg.attributes
        .iter()
        .find_map(|a| match a {
            LinkAttribute::IfName(name) => Some(Event::Link {
                ifindex,
                name: name.clone(),
                up: msg.header.flags.contains(LinkFlags::Up),
            }),
            _ => None,
        })
        .into_iter()
        .collect()
}

fn addr_events(msg: &AddressMessage, op: Op) -> Vec<Event> {
    if msg.header.family != AddressFamily::Inet {
        return Vec::new();
    }
    vec![Event::Addr {
        ifindex: msg.header.index,
        op,
    }]
}

fn route_events(log: &slog::Logger, msg: &RouteMessage, op: Op) -> Vec<Event> {
    if msg.header.address_family != AddressFamily::Inet
        || msg.header.kind != RouteType::Unicast
    {
        return Vec::new();
    }

    let mut dst = Ipv4Addr::UNSPECIFIED;
    let mut gateway = None;
    let mut oif = None;
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(RouteAddress::Inet(a)) => dst = *a,
            RouteAttribute::Gateway(RouteAddress::Inet(a)) => gateway = Some(*a),
            RouteAttribute::Oif(i) => oif = Some(*i),
            _ => {}
        }
    }
    match route::subnet(dst, msg.header.destination_prefix_length) {
        Ok(subnet) => vec![Event::Route {
            subnet,
            op,
            gateway,
            oif,
        }],
        Err(e) => {
            debug!(log, "skipping route"; "error" => %e);
            Vec::new()
        }
    }
}

fn neigh_events(msg: &NeighbourMessage, op: Op) -> Vec<Event> {
    let mut ip = None;
    let mut mac = None;
    for attr in &msg.attributes {
        match attr {
            NeighbourAttribute::Destination(NeighbourAddress::Inet(a)) => {
                ip = Some(*a)
            }
            NeighbourAttribute::LinkLocalAddress(b) => {
                mac = MacAddr::try_from_slice(b)
            }
            _ => {}
        }
    }
    match ip {
        Some(ip) => vec![Event::Neigh {
            ip,
            ifindex: msg.header.ifindex,
            mac,
            op,
        }],
        None => Vec::new(),
    }
}

/// Translate one rtnetlink message into the events it carries.
pub fn to_events(log: &slog::Logger, msg: &RouteNetlinkMessage) -> Vec<Event> {
    use RouteNetlinkMessage as M;
    match msg {
        M::NewLink(m) => link_events(m, Op::Added),
        M::DelLink(m) => link_events(m, Op::Removed),
        M::NewAddress(m) => addr_events(m, Op::Added),
        M::DelAddress(m) => addr_events(m, Op::Removed),
        M::NewRoute(m) => route_events(log, m, Op::Added),
        M::DelRoute(m) => route_events(log, m, Op::Removed),
        M::NewNeighbour(m) => neigh_events(m, Op::Added),
        M::DelNeighbour(m) => neigh_events(m, Op::Removed),
        _ => Vec::new(),
    }
}

// Split a datagram into its netlink messages.
fn parse(log: &slog::Logger, buf: &[u8]) -> Vec<Event> {
    let mut events = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let msg = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(
            &buf[offset..],
        ) {
            Ok(m) => m,
            Err(e) => {
                error!(log, "bad netlink message"; "error" => %e);
                break;
            }
        };
        let len = msg.header.length as usize;
        if len == 0 {
            break;
        }
        offset += (len + 3) & !3;

        if let NetlinkPayload::InnerMessage(inner) = &msg.payload {
            events.extend(to_events(log, inner));
        }
    }
    events
}

// The socket survives an overrun or an interrupted read.  An overrun means
// notifications were lost, and the tables may lag the kernel until the
// affected objects change again.
fn recv_error_is_fatal(e: &std::io::Error) -> bool {
    !matches!(e.raw_os_error(), Some(libc::ENOBUFS) | Some(libc::EINTR))
}

fn open() -> SwdResult<Socket> {
    let mut socket = Socket::new(NETLINK_ROUTE)?;
    let groups =
        RTMGRP_LINK | RTMGRP_NEIGH | RTMGRP_IPV4_IFADDR | RTMGRP_IPV4_ROUTE;
    socket.bind(&SocketAddr::new(0, groups))?;
    Ok(socket)
}

/// Subscribe to the kernel's link, address, route and neighbor notifications,
/// and forward the resulting events until the receiver goes away.
pub fn start(
    log: &slog::Logger,
    events: mpsc::UnboundedSender<Event>,
) -> SwdResult<std::thread::JoinHandle<()>> {
    let log = log.new(o!("unit" => "netlink"));
    let socket = open()?;
    info!(log, "listening for rtnetlink notifications");

    std::thread::Builder::new()
        .name("netlink".to_string())
        .spawn(move || loop {
            let buf = match socket.recv_from_full() {
                Ok((buf, _)) => buf,
                Err(e) if !recv_error_is_fatal(&e) => {
                    warn!(log, "netlink receive interrupted"; "error" => %e);
                    continue;
                }
                Err(e) => {
                    error!(log, "netlink receive failed"; "error" => %e);
                    return;
                }
            };
            for event in parse(&log, &buf) {
                trace!(log, "event"; "event" => ?event);
                if events.send(event).is_err() {
                    info!(log, "event receiver closed");
                    return;
                }
            }
        })
        .map_err(SwdError::Io)
}
