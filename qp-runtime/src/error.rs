// Copyright 2018-2022 Clemens Lutz
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use error_chain::error_chain;

error_chain! {
    errors {
        InvalidArgument(msg: String) {
            description("Invalid argument error")
            display("Aborted with: {}", msg)
        }
        IntegerOverflow(msg: String) {
            description("Integer overflow error")
            display("Aborted with: {}", msg)
        }
        OutOfBounds(msg: String) {
            description("Out of bounds memory access")
            display("Aborted with: {}", msg)
        }
        LaunchError(msg: String) {
            description("Kernel launch error")
            display("Aborting with: {}", msg)
        }
        SharedMemoryExceeded(requested: usize, available: usize) {
            description("Shared memory capacity exceeded")
            display(
                "Aborting with: requested {} bytes of shared memory, but only {} bytes are available",
                requested,
                available
            )
        }
        RuntimeError(msg: String) {
            description("Runtime error")
            display("Aborting with: {}", msg)
        }
    }

    foreign_links {
        RayonThreadPoolBuild(rayon::ThreadPoolBuildError);
    }
}
