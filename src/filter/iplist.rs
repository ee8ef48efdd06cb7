use std::net::IpAddr;

use axum::http::StatusCode;
use ipnet::IpNet;
use tracing::warn;

use super::{reject, Filter, FilterContext, FILTER_BLACKLIST, FILTER_WHITELIST};
use crate::error::Result;

/// True when `ip` falls inside any entry of the list. Entries are CIDR
/// blocks or bare addresses.
fn ip_in_list(ip: IpAddr, list: &[String]) -> bool {
    list.iter().any(|entry| match entry.parse::<IpNet>() {
        Ok(net) => net.contains(&ip),
        Err(_) => match entry.parse::<IpAddr>() {
            Ok(single) => single == ip,
            Err(_) => {
                warn!("filter: unparsable ip list entry <{}>", entry);
                false
            }
        },
    })
}

/// Denies requests whose client address is on the API's blacklist
pub struct BlackListFilter;

impl Filter for BlackListFilter {
    fn name(&self) -> &'static str {
        FILTER_BLACKLIST
    }

    fn pre(&self, ctx: &mut FilterContext<'_>) -> Result<()> {
        let Some(acl) = &ctx.api.spec.access_control else {
            return Ok(());
        };
        let Some(ip) = ctx.req.client_ip else {
            return Ok(());
        };

        if ip_in_list(ip, &acl.blacklist) {
            return Err(reject(
                FILTER_BLACKLIST,
                StatusCode::FORBIDDEN,
                format!("{} is blacklisted", ip),
            ));
        }
        Ok(())
    }
}

/// Denies requests whose client address is not on the API's whitelist. An
/// empty whitelist admits everyone.
pub struct WhiteListFilter;

impl Filter for WhiteListFilter {
    fn name(&self) -> &'static str {
        FILTER_WHITELIST
    }

    fn pre(&self, ctx: &mut FilterContext<'_>) -> Result<()> {
        let Some(acl) = &ctx.api.spec.access_control else {
            return Ok(());
        };
        if acl.whitelist.is_empty() {
            return Ok(());
        }

        let allowed = ctx
            .req
            .client_ip
            .map(|ip| ip_in_list(ip, &acl.whitelist))
            .unwrap_or(false);

        if !allowed {
            return Err(reject(
                FILTER_WHITELIST,
                StatusCode::FORBIDDEN,
                "client not whitelisted",
            ));
        }
        Ok(())
    }
}
