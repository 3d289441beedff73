// This file is part of Astar.

// Copyright (C) Stake Technologies Pte.Ltd.
// SPDX-License-Identifier: GPL-3.0-or-later

// Astar is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Astar is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Astar. If not, see <http://www.gnu.org/licenses/>.

//! Wrapped deposit precompile.
//!
//! Forwards ether or ERC20 tokens to a receiver contract on behalf of the caller and
//! notifies the receiver about who deposited and how much. The receiver must implement
//! `DepositReceiver.sol` and answer each notification with the selector of the function
//! that was called.
//!
//! Every failure reverts the whole call, so a failed deposit never moves any asset.

#![cfg_attr(not(feature = "std"), no_std)]

use core::marker::PhantomData;
use fp_evm::{Context, ExitError, ExitReason, PrecompileFailure, PrecompileHandle, Transfer};
use precompile_utils::{
    evm::costs::call_cost,
    precompile_set::{get_address_type, AddressType},
    prelude::*,
    solidity::{self, codec::Writer},
};
use sp_core::{H160, U256};
use sp_std::vec::Vec;


pub const LOG_TARGET: &str = "wrapped-deposit-precompile";

/// Solidity selector of the EtherDeposited log, which is the Keccak of the Log signature.
pub const SELECTOR_LOG_ETHER_DEPOSITED: [u8; 32] =
    keccak256!("EtherDeposited(address,address,uint256)");

/// Solidity selector of the ERC20Deposited log, which is the Keccak of the Log signature.
pub const SELECTOR_LOG_ERC20_DEPOSITED: [u8; 32] =
    keccak256!("ERC20Deposited(address,address,address,uint256)");

/// `DepositReceiver.onEtherDeposit(address,uint256)`
pub const SELECTOR_ON_ETHER_DEPOSIT: u32 =
    function_selector(keccak256!("onEtherDeposit(address,uint256)"));

/// `DepositReceiver.onERC20Deposit(address,address,uint256)`
pub const SELECTOR_ON_ERC20_DEPOSIT: u32 =
    function_selector(keccak256!("onERC20Deposit(address,address,uint256)"));

/// `ERC20.transferFrom(address,address,uint256)`
pub const SELECTOR_TRANSFER_FROM: u32 =
    function_selector(keccak256!("transferFrom(address,address,uint256)"));

/// Size of an ABI encoded `bytes4` return value.
const ACKNOWLEDGEMENT_LEN: usize = 32;

const fn function_selector(hash: [u8; 32]) -> u32 {
    u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
}

/// Reasons a deposit is refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepositError {
    /// Target (or token) address has no code.
    NonContractTarget,
    /// Target does not acknowledge the acceptance function.
    SelectorNotRecognized,
    /// Target answered with data that is not a single `bytes4` word.
    UnexpectedReturnData,
    /// Target acknowledges the ether deposit but refuses value.
    NonPayableReceiver,
    /// Token refused to move the funds.
    TransferFailed,
}

impl DepositError {
    /// Revert reason reported to the caller.
    pub fn reason(&self) -> &'static str {
        match self {
            DepositError::NonContractTarget => "noncontract",
            DepositError::SelectorNotRecognized => "unrecognized selector",
            DepositError::UnexpectedReturnData => "unexpected return data",
            DepositError::NonPayableReceiver => "nonpayable receiver",
            DepositError::TransferFailed => "transfer failed",
        }
    }
}

impl From<DepositError> for PrecompileFailure {
    fn from(error: DepositError) -> Self {
        revert(error.reason())
    }
}

/// Checks the answer of a receiver acceptance function.
///
/// The answer must be exactly one ABI word holding `selector` as `bytes4`.
pub fn check_acknowledgement(selector: u32, output: &[u8]) -> Result<(), DepositError> {
    if output.len() != ACKNOWLEDGEMENT_LEN {
        return Err(DepositError::UnexpectedReturnData);
    }

    let (head, padding) = output.split_at(4);
    if head != selector.to_be_bytes() || padding.iter().any(|byte| *byte != 0) {
        return Err(DepositError::SelectorNotRecognized);
    }

    Ok(())
}

/// Checks the output of a successful `transferFrom` call.
///
/// Tokens that don't return anything are accepted, otherwise the first word must be `true`.
pub fn check_transfer_output(output: &[u8]) -> Result<(), DepositError> {
    if output.is_empty() {
        return Ok(());
    }

    match output.get(..32) {
        Some(word) if U256::from_big_endian(word) == U256::one() => Ok(()),
        _ => Err(DepositError::TransferFailed),
    }
}

/// A precompile that forwards deposits to receiver contracts.
pub struct WrappedDepositPrecompile<Runtime>(PhantomData<Runtime>);

#[precompile_utils::precompile]
impl<Runtime> WrappedDepositPrecompile<Runtime>
where
    Runtime: pallet_evm::Config,
{
    /// Forward the attached value to `target` and notify it with `onEtherDeposit`.
    #[precompile::public("depositEther(address)")]
    #[precompile::payable]
    fn deposit_ether(handle: &mut impl PrecompileHandle, target: Address) -> EvmResult {
        let depositor = handle.context().caller;
        let precompile = handle.context().address;
        let amount = handle.context().apparent_value;
        let target: H160 = target.into();

        log::trace!(
            target: LOG_TARGET,
            "deposit_ether: depositor: {:?}, target: {:?}, amount: {:?}",
            depositor,
            target,
            amount
        );

        // Known size, so the log can never fail after the funds have moved.
        handle.record_log_costs_manual(3, 32)?;

        Self::ensure_contract(handle, target)?;

        let input = Writer::new_with_selector(SELECTOR_ON_ETHER_DEPOSIT)
            .write(Address(depositor))
            .write(amount)
            .build();
        Self::notify_receiver(handle, target, SELECTOR_ON_ETHER_DEPOSIT, input, amount)?;

        log3(
            precompile,
            SELECTOR_LOG_ETHER_DEPOSITED,
            depositor,
            target,
            solidity::encode_event_data(amount),
        )
        .record(handle)?;

        Ok(())
    }

    /// Move `amount` of `token` from the caller to `target` and notify it with `onERC20Deposit`.
    ///
    /// The caller must have approved this precompile for at least `amount`.
    #[precompile::public("depositERC20(address,address,uint256)")]
    fn deposit_erc20(
        handle: &mut impl PrecompileHandle,
        target: Address,
        token: Address,
        amount: U256,
    ) -> EvmResult {
        let depositor = handle.context().caller;
        let precompile = handle.context().address;
        let target: H160 = target.into();
        let token: H160 = token.into();

        log::trace!(
            target: LOG_TARGET,
            "deposit_erc20: depositor: {:?}, target: {:?}, token: {:?}, amount: {:?}",
            depositor,
            target,
            token,
            amount
        );

        handle.record_log_costs_manual(4, 32)?;

        Self::ensure_contract(handle, target)?;
        // An account without code would accept the call and look like a non-standard token.
        Self::ensure_contract(handle, token)?;

        Self::pull_tokens(handle, token, depositor, target, amount)?;

        let input = Writer::new_with_selector(SELECTOR_ON_ERC20_DEPOSIT)
            .write(Address(depositor))
            .write(Address(token))
            .write(amount)
            .build();
        Self::notify_receiver(
            handle,
            target,
            SELECTOR_ON_ERC20_DEPOSIT,
            input,
            U256::zero(),
        )?;

        log4(
            precompile,
            SELECTOR_LOG_ERC20_DEPOSITED,
            depositor,
            target,
            token,
            solidity::encode_event_data(amount),
        )
        .record(handle)?;

        Ok(())
    }

    fn ensure_contract(handle: &mut impl PrecompileHandle, address: H160) -> EvmResult {
        match get_address_type::<Runtime>(handle, address)? {
            AddressType::EOA => {
                log::trace!(target: LOG_TARGET, "no code at {:?}", address);
                Err(DepositError::NonContractTarget.into())
            }
            _ => Ok(()),
        }
    }

    /// Call `transferFrom(from, to, amount)` on `token` as this precompile.
    fn pull_tokens(
        handle: &mut impl PrecompileHandle,
        token: H160,
        from: H160,
        to: H160,
        amount: U256,
    ) -> EvmResult {
        let input = Writer::new_with_selector(SELECTOR_TRANSFER_FROM)
            .write(Address(from))
            .write(Address(to))
            .write(amount)
            .build();

        match Self::call_contract(handle, token, input, U256::zero())? {
            (ExitReason::Succeed(_), output) => {
                check_transfer_output(&output).map_err(|error| {
                    log::trace!(
                        target: LOG_TARGET,
                        "token {:?} refused transfer, output: {:?}",
                        token,
                        output
                    );
                    error.into()
                })
            }
            (ExitReason::Revert(_) | ExitReason::Error(_), _) => {
                log::trace!(target: LOG_TARGET, "token {:?} transfer reverted", token);
                Err(DepositError::TransferFailed.into())
            }
            (ExitReason::Fatal(exit_status), _) => Err(PrecompileFailure::Fatal { exit_status }),
        }
    }

    /// Call an acceptance function of `target` and make sure it acknowledged the deposit.
    fn notify_receiver(
        handle: &mut impl PrecompileHandle,
        target: H160,
        selector: u32,
        input: Vec<u8>,
        value: U256,
    ) -> EvmResult {
        // Only a call carrying value may need to be replayed without it.
        let retry_input = if value.is_zero() {
            None
        } else {
            Some(input.clone())
        };
        let (reason, output) = Self::call_contract(handle, target, input, value)?;

        match reason {
            ExitReason::Succeed(_) => check_acknowledgement(selector, &output).map_err(|error| {
                log::trace!(
                    target: LOG_TARGET,
                    "receiver {:?} answered {:?}: {:?}",
                    target,
                    output,
                    error
                );
                error.into()
            }),
            // Receiver gave a reason, let the caller see it.
            ExitReason::Revert(exit_status) if !output.is_empty() => {
                log::trace!(target: LOG_TARGET, "receiver {:?} reverted", target);
                Err(PrecompileFailure::Revert {
                    exit_status,
                    output,
                })
            }
            ExitReason::Revert(_) => {
                // A silent revert is what both a missing function and a non-payable one
                // produce when value is attached. Retry without value to tell them apart,
                // whatever the retry changed is dropped with the revert below.
                if let Some(input) = retry_input {
                    if Self::acknowledges(handle, target, selector, input)? {
                        return Err(DepositError::NonPayableReceiver.into());
                    }
                }
                Err(DepositError::SelectorNotRecognized.into())
            }
            ExitReason::Error(exit_status) => Err(PrecompileFailure::Error { exit_status }),
            ExitReason::Fatal(exit_status) => Err(PrecompileFailure::Fatal { exit_status }),
        }
    }

    fn acknowledges(
        handle: &mut impl PrecompileHandle,
        target: H160,
        selector: u32,
        input: Vec<u8>,
    ) -> EvmResult<bool> {
        match Self::call_contract(handle, target, input, U256::zero())? {
            (ExitReason::Succeed(_), output) => {
                Ok(check_acknowledgement(selector, &output).is_ok())
            }
            (ExitReason::Revert(_), _) => Ok(false),
            (ExitReason::Error(exit_status), _) => Err(PrecompileFailure::Error { exit_status }),
            (ExitReason::Fatal(exit_status), _) => Err(PrecompileFailure::Fatal { exit_status }),
        }
    }

    /// Perform a subcall with this precompile as the caller, forwarding all gas but the call cost.
    fn call_contract(
        handle: &mut impl PrecompileHandle,
        address: H160,
        input: Vec<u8>,
        value: U256,
    ) -> EvmResult<(ExitReason, Vec<u8>)> {
        // The handle charges the call itself, keep enough gas aside for it.
        let call_cost = call_cost(value, <Runtime as pallet_evm::Config>::config());
        let forwarded_gas = match handle.remaining_gas().checked_sub(call_cost) {
            Some(remaining) => remaining,
            None => {
                log::trace!(target: LOG_TARGET, "not enough gas to call {:?}", address);
                return Err(PrecompileFailure::Error {
                    exit_status: ExitError::OutOfGas,
                });
            }
        };

        let caller = handle.context().address;
        let transfer = if value.is_zero() {
            None
        } else {
            Some(Transfer {
                source: caller,
                target: address,
                value,
            })
        };
        let context = Context {
            caller,
            address,
            apparent_value: value,
        };

        Ok(handle.call(
            address,
            transfer,
            input,
            Some(forwarded_gas),
            false,
            &context,
        ))
    }
}
